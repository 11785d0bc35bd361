//! Periodic reclamation passes.
//!
//! Each pass selects jobs by status and age, optionally only when a volume is low on
//! space, and acts on them. Passes never fail: problems with individual jobs are
//! logged and the job is picked up again next cycle.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::files::{DeleteSeverity, FileStore};
use crate::scheduler::job::{Job, JobChange, JobStatus, FINAL_STATES, TRANSITIVE_STATES};
use crate::service::JobService;
use crate::store::JobStore;

pub struct Sweeper {
    config: Arc<NodeConfig>,
    store: Arc<dyn JobStore>,
    files: Arc<FileStore>,
    service: Arc<JobService>,
}

fn minutes_before(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    now - Duration::minutes(minutes)
}

impl Sweeper {
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<dyn JobStore>,
        files: Arc<FileStore>,
        service: Arc<JobService>,
    ) -> Self {
        Self {
            config,
            store,
            files,
            service,
        }
    }

    async fn select(&self, status: JobStatus, before: DateTime<Utc>) -> Vec<Job> {
        match self.store.find_by_status_updated_before(status, before).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(status = %status, error = %e, "Sweep query failed");
                Vec::new()
            }
        }
    }

    async fn set_status(&self, job: &Job, status: JobStatus) -> bool {
        match self.store.apply(job.id, JobChange::Status(status)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Sweep could not update job");
                false
            }
        }
    }

    /// Deletes results that were downloaded long ago, when the results volume runs low.
    pub async fn reap_claimed(&self, now: DateTime<Utc>) -> usize {
        let cleanup = &self.config.cleanup;
        let free = self.files.results_free_mb();
        if free > cleanup.claimed_space_mb {
            return 0;
        }

        let jobs = self
            .select(
                JobStatus::Downloaded,
                minutes_before(now, cleanup.claimed_time_mins),
            )
            .await;
        if jobs.is_empty() {
            tracing::warn!(free_mb = free, "Below claimed threshold, but no claimed files to remove");
            return 0;
        }

        let mut removed = 0;
        let mut bytes = 0;
        for job in &jobs {
            self.files
                .delete_result_file(job.id, "claimed and too old", DeleteSeverity::Error)
                .await;
            if self.set_status(job, JobStatus::Deleted).await {
                removed += 1;
                bytes += job.compressed_size;
            }
        }
        tracing::info!(
            removed,
            total_mb = bytes / crate::space::MB,
            "Claimed files cleanup finished"
        );
        removed
    }

    /// Deletes results nobody downloaded in time, when the results volume runs low.
    pub async fn reap_unclaimed(&self, now: DateTime<Utc>) -> usize {
        let cleanup = &self.config.cleanup;
        let free = self.files.results_free_mb();
        if free > cleanup.unclaimed_space_mb {
            return 0;
        }

        let jobs = self
            .select(
                JobStatus::Ready,
                minutes_before(now, cleanup.unclaimed_time_mins),
            )
            .await;
        if jobs.is_empty() {
            tracing::error!(free_mb = free, "Below unclaimed threshold, but no unclaimed files to remove");
            return 0;
        }

        let mut removed = 0;
        for job in &jobs {
            tracing::info!(
                job_id = %job.id,
                name = %job.name,
                processed_at = %job.updated_at,
                "Removing unclaimed file"
            );
            self.files
                .delete_result_file(job.id, "unclaimed but too old", DeleteSeverity::Error)
                .await;
            if self
                .set_status(job, JobStatus::DeletedWithoutDownloading)
                .await
            {
                removed += 1;
            }
        }
        tracing::info!(removed, "Unclaimed files cleanup finished");
        removed
    }

    /// Removes leftover files of failed jobs when either volume runs low. Status is untouched.
    pub async fn reap_error_zombies(&self, now: DateTime<Utc>) -> usize {
        let cleanup = &self.config.cleanup;
        if self.files.queue_free_mb() > cleanup.error_space_mb
            && self.files.results_free_mb() > cleanup.error_space_mb
        {
            return 0;
        }

        let jobs = self
            .select(JobStatus::Error, minutes_before(now, cleanup.error_time_mins))
            .await;
        for job in &jobs {
            tracing::info!(job_id = %job.id, name = %job.name, "Removing files of failed job");
            self.files
                .delete_queue_file(job.id, "marked as ERROR", DeleteSeverity::Debug)
                .await;
            self.files
                .delete_result_file(job.id, "marked as ERROR", DeleteSeverity::Debug)
                .await;
        }
        jobs.len()
    }

    /// Fails jobs stuck in states that should only last moments.
    pub async fn reap_transitive(&self, now: DateTime<Utc>) -> usize {
        let before = minutes_before(now, self.config.cleanup.transitive_time_mins);
        let jobs = match self
            .store
            .find_by_statuses_updated_before(&TRANSITIVE_STATES, before)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Sweep query failed");
                return 0;
            }
        };

        let mut failed = 0;
        for job in &jobs {
            tracing::error!(
                job_id = %job.id,
                name = %job.name,
                status = %job.status,
                "Job stuck too long, marking it as ERROR"
            );
            match self.service.fail_job(job.id).await {
                Ok(()) => failed += 1,
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to fail stuck job"),
            }
        }
        failed
    }

    /// Catch-all for anything non-final that has not moved for a long time.
    ///
    /// EMAIL_PENDING jobs get their owner's batch notification retried (once per owner).
    /// IN_QUEUE jobs get a longer allowance before they are failed.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> usize {
        let cleanup = &self.config.cleanup;
        let before = minutes_before(now, cleanup.stale_time_mins);
        let in_queue_before = minutes_before(now, cleanup.in_queue_time_mins);
        let jobs = match self
            .store
            .find_excluding_statuses_updated_before(&FINAL_STATES, before)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Sweep query failed");
                return 0;
            }
        };

        let mut notified: HashSet<String> = HashSet::new();
        let mut handled = 0;
        for job in &jobs {
            match job.status {
                JobStatus::EmailPending => {
                    if !notified.insert(job.email.clone()) {
                        // already covered by this owner's batch
                        continue;
                    }
                    match self.service.send_batch(&job.email).await {
                        Ok(_) => handled += 1,
                        Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Retrying notification failed"),
                    }
                }
                JobStatus::InQueue if job.updated_at >= in_queue_before => {}
                _ => {
                    tracing::error!(
                        job_id = %job.id,
                        name = %job.name,
                        status = %job.status,
                        "Job stale, marking it as ERROR"
                    );
                    match self.service.fail_job(job.id).await {
                        Ok(()) => handled += 1,
                        Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to fail stale job"),
                    }
                }
            }
        }
        handled
    }

    /// Resubmits uploads dropped into the recovery directory under the id of a failed job.
    pub async fn recover_failed(&self) -> usize {
        let mut recovered = 0;
        for path in self.files.recovery_files().await {
            let id = match path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Uuid::parse_str(n).ok())
            {
                Some(id) => id,
                None => {
                    tracing::warn!(path = %path.display(), "Recovery file is not named by a job id, skipping");
                    continue;
                }
            };

            let job = match self.store.find_by_id(id).await {
                Ok(Some(job)) if job.status == JobStatus::Error => job,
                Ok(other) => {
                    tracing::warn!(
                        job_id = %id,
                        status = ?other.map(|j| j.status),
                        "Job is not failed, won't attempt recovery"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Failed to load job for recovery");
                    continue;
                }
            };

            self.files
                .delete_queue_file(id, "replaced by recovery", DeleteSeverity::Debug)
                .await;
            match self.service.resubmit_recovered(&job, &path).await {
                Ok(Ok((new_id, _))) => {
                    tracing::info!(job_id = %id, new_job_id = %new_id, "Recovered failed job");
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove recovery file");
                    }
                    recovered += 1;
                }
                Ok(Err(reason)) => {
                    tracing::warn!(job_id = %id, %reason, "Recovery not admitted, will retry");
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Recovery failed");
                }
            }
        }
        recovered
    }
}
