use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{CompressorError, Result};
use crate::scheduler::job::IN_QUEUE_STATES;
use crate::scheduler::{Job, JobChange, JobStatus, NewJob, NodeRef, WorkerNode};
use crate::store::JobStore;

/// Keeps every record in memory. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    workers: RwLock<HashMap<String, WorkerNode>>,
    /// Last progress written per job, to skip redundant writes.
    progress_cache: Mutex<HashMap<Uuid, u8>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record as-is.
    pub async fn insert(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// All jobs sorted by creation time.
    pub async fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    async fn filter<F>(&self, pred: F) -> Vec<Job>
    where
        F: Fn(&Job) -> bool,
    {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| pred(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        let job = Job::new(new);
        self.jobs.write().await.insert(job.id, job.clone());
        tracing::debug!(job_id = %job.id, name = %job.name, "Job record created");
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_by_origin_id(&self, origin_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.origin_id == Some(origin_id))
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn count_in_queue(&self) -> Result<usize> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| IN_QUEUE_STATES.contains(&j.status))
            .count())
    }

    async fn count_in_queue_for_owner(&self, email: &str) -> Result<usize> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.email == email && IN_QUEUE_STATES.contains(&j.status))
            .count())
    }

    async fn find_by_status_updated_before(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        Ok(self
            .filter(|j| j.status == status && j.updated_at < before)
            .await)
    }

    async fn find_by_statuses_updated_before(
        &self,
        statuses: &[JobStatus],
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        Ok(self
            .filter(|j| statuses.contains(&j.status) && j.updated_at < before)
            .await)
    }

    async fn find_excluding_statuses_updated_before(
        &self,
        excluded: &[JobStatus],
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        Ok(self
            .filter(|j| !excluded.contains(&j.status) && j.updated_at < before)
            .await)
    }

    async fn find_by_status_and_node(
        &self,
        status: JobStatus,
        node: &NodeRef,
    ) -> Result<Vec<Job>> {
        Ok(self
            .filter(|j| j.status == status && &j.node == node)
            .await)
    }

    async fn find_processing_on_remote_nodes(&self) -> Result<Vec<Job>> {
        Ok(self
            .filter(|j| j.status == JobStatus::Processing && !j.node.is_local())
            .await)
    }

    async fn find_by_owner_and_statuses(
        &self,
        email: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>> {
        Ok(self
            .filter(|j| j.email == email && statuses.contains(&j.status))
            .await)
    }

    async fn find_by_owner_excluding_statuses(
        &self,
        email: &str,
        excluded: &[JobStatus],
    ) -> Result<Vec<Job>> {
        Ok(self
            .filter(|j| j.email == email && !excluded.contains(&j.status))
            .await)
    }

    async fn apply(&self, id: Uuid, change: JobChange) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| {
            tracing::error!(job_id = %id, "Attempted to update a job that does not exist");
            CompressorError::JobNotFound(id)
        })?;

        let from = job.status;
        if !job.apply(&change) {
            return Err(CompressorError::IllegalTransition {
                job_id: id,
                from,
                to: change.target_status(),
            });
        }
        if from != job.status {
            tracing::debug!(job_id = %id, from = %from, to = %job.status, "Job status changed");
        }
        let updated = job.clone();
        drop(jobs);

        if matches!(change, JobChange::Processed { .. }) || updated.status.is_final() {
            self.progress_cache.lock().await.remove(&id);
        }
        Ok(updated)
    }

    async fn transition_owner_jobs(
        &self,
        email: &str,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.write().await;
        let mut moved = Vec::new();
        for job in jobs
            .values_mut()
            .filter(|j| j.email == email && from.contains(&j.status))
        {
            if job.apply(&JobChange::Status(to)) {
                moved.push(job.clone());
            }
        }
        Ok(moved)
    }

    async fn update_progress(&self, id: Uuid, progress: u8, speed: f32) -> Result<bool> {
        let mut cache = self.progress_cache.lock().await;
        if cache.get(&id) == Some(&progress) {
            return Ok(false);
        }

        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) => {
                job.progress = progress;
                job.speed = speed;
                job.updated_at = Utc::now();
                cache.insert(id, progress);
                Ok(true)
            }
            None => {
                tracing::warn!(job_id = %id, "Progress update for unknown job");
                Ok(false)
            }
        }
    }

    async fn get_or_create_worker(&self, host: &str) -> Result<WorkerNode> {
        let mut workers = self.workers.write().await;
        Ok(workers
            .entry(host.to_string())
            .or_insert_with(|| WorkerNode::new(host))
            .clone())
    }

    async fn save_worker(&self, worker: &WorkerNode) -> Result<()> {
        self.workers
            .write()
            .await
            .insert(worker.host.clone(), worker.clone());
        Ok(())
    }

    async fn set_worker_queue_size(&self, host: &str, queue_size: usize) -> Result<()> {
        let mut workers = self.workers.write().await;
        workers
            .entry(host.to_string())
            .or_insert_with(|| WorkerNode::new(host))
            .queue_size = queue_size;
        Ok(())
    }
}
