use std::sync::Arc;

use crate::error::Result;
use crate::remote::RemoteNodeClient;
use crate::scheduler::job::{Job, JobStatus, NodeRef};
use crate::scheduler::WorkQueue;
use crate::store::JobStore;

/// Cross-checks jobs believed to be running remotely against what their worker reports.
pub struct IntegrityChecker {
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteNodeClient>,
    queue: Arc<WorkQueue>,
}

impl IntegrityChecker {
    pub fn new(
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteNodeClient>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            store,
            remote,
            queue,
        }
    }

    /// Checks every remotely processing job. Returns how many were reassigned.
    pub async fn check_all(&self) -> Result<usize> {
        let jobs = self.store.find_processing_on_remote_nodes().await?;
        self.verify_all(jobs).await
    }

    /// Checks only jobs on `host`, used when a dead worker comes back.
    pub async fn check_worker(&self, host: &str) -> Result<usize> {
        let jobs = self
            .store
            .find_by_status_and_node(JobStatus::Processing, &NodeRef::Remote(host.to_string()))
            .await?;
        self.verify_all(jobs).await
    }

    async fn verify_all(&self, jobs: Vec<Job>) -> Result<usize> {
        let mut reassigned = 0;
        for job in jobs {
            if self.verify(&job).await {
                continue;
            }
            // the snapshot may be stale by now; reinsert only if the job is still on that node
            match self.queue.reinsert(job.id, &job.node, true).await {
                Ok(Some(_)) => reassigned += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(job_id = %job.id, error = %e, "Failed to reassign job"),
            }
        }
        if reassigned > 0 {
            tracing::info!(reassigned, "Integrity check reassigned jobs");
        }
        Ok(reassigned)
    }

    /// True if the job's worker still holds it. A failed lookup counts as missing.
    async fn verify(&self, job: &Job) -> bool {
        let Some(host) = job.node.host() else {
            return true;
        };
        match self.remote.is_job_in_queue(host, job.id).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(
                    job_id = %job.id,
                    name = %job.name,
                    host = %host,
                    "Job not found in worker queue, readding to queue"
                );
                false
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, host = %host, error = %e, "Queue lookup failed, readding job");
                false
            }
        }
    }
}
