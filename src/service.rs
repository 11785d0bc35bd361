//! Job lifecycle operations around the Work Queue: staging uploads, finalizing encodes,
//! owner notification, downloads, and both sides of the worker protocol.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{CompressorError, RejectionReason, Result};
use crate::files::{DeleteSeverity, FileStore};
use crate::notify::Notifier;
use crate::remote::{QueueStatus, RemoteNodeClient};
use crate::scheduler::job::{FINAL_STATES, IN_QUEUE_STATES, NOTIFICATION_PENDING_STATES};
use crate::scheduler::{
    Accepted, Job, JobChange, JobOrigin, JobOutcome, JobStatus, NewJob, QueuedJob, WorkQueue,
};
use crate::space::{SpaceAccountant, MB};
use crate::store::JobStore;

/// Result of staging and admitting an upload.
pub type UploadAdmission = std::result::Result<(Uuid, Accepted), RejectionReason>;

pub struct JobService {
    config: Arc<NodeConfig>,
    store: Arc<dyn JobStore>,
    files: Arc<FileStore>,
    space: Arc<SpaceAccountant>,
    queue: Arc<WorkQueue>,
    remote: Arc<dyn RemoteNodeClient>,
    notifier: Arc<dyn Notifier>,
}

impl JobService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<dyn JobStore>,
        files: Arc<FileStore>,
        space: Arc<SpaceAccountant>,
        queue: Arc<WorkQueue>,
        remote: Arc<dyn RemoteNodeClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            files,
            space,
            queue,
            remote,
            notifier,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Space check for an upload of `size` bytes, counting bytes promised to other uploads.
    pub fn check_space(&self, size: u64) -> std::result::Result<(), RejectionReason> {
        let available = self.space.available_mb();
        let size_mb = (size / MB) as i64;
        if available - size_mb > self.config.space.minimum_space_remaining_mb {
            Ok(())
        } else {
            tracing::warn!(
                available_mb = available,
                size_mb,
                threshold_mb = self.config.space.minimum_space_remaining_mb,
                "Not enough space for upload"
            );
            Err(RejectionReason::NotEnoughSpace)
        }
    }

    /// Stage an upload from its owner and hand it to the Work Queue.
    pub async fn submit_upload<R>(
        &self,
        name: &str,
        email: &str,
        size: u64,
        body: &mut R,
    ) -> Result<UploadAdmission>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        if let Err(reason) = self.check_space(size) {
            return Ok(Err(reason));
        }
        let job = self.stage(NewJob::local(name, email, size), body).await?;
        self.admit(&job).await
    }

    /// Worker side: stage a job pushed by a master. It is pinned to this node.
    pub async fn accept_remote_work<R>(
        &self,
        origin_id: Uuid,
        name: &str,
        size: u64,
        return_url: &str,
        body: &mut R,
    ) -> Result<UploadAdmission>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        if let Err(reason) = self.check_space(size) {
            return Ok(Err(reason));
        }
        let job = self
            .stage(NewJob::from_master(name, size, return_url, origin_id), body)
            .await?;
        tracing::info!(job_id = %job.id, origin_id = %origin_id, "Accepted work from master");
        self.admit(&job).await
    }

    /// Creates the record and writes the body to the queue directory while holding a
    /// space reservation.
    async fn stage<R>(&self, new: NewJob, body: &mut R) -> Result<Job>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let size = new.size;
        let job = self.store.create_job(new).await?;

        let written = {
            let _reservation = self.space.reserve_guard(size);
            self.files.save_to_queue(job.id, body).await
        };
        match written {
            Ok(written) => {
                self.store
                    .apply(job.id, JobChange::Uploaded {
                        original_size: written,
                    })
                    .await
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to store upload");
                self.store
                    .apply(job.id, JobChange::Status(JobStatus::Error))
                    .await?;
                self.files
                    .delete_queue_file(job.id, "failed upload", DeleteSeverity::Debug)
                    .await;
                Err(e)
            }
        }
    }

    async fn admit(&self, job: &Job) -> Result<UploadAdmission> {
        let admission = self.queue.submit(QueuedJob::from_job(job)).await?;
        Ok(admission.map(|accepted| (job.id, accepted)))
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(CompressorError::JobNotFound(id))
    }

    /// Every job of an owner that has not reached a final state.
    pub async fn jobs_for_owner(&self, email: &str) -> Result<Vec<Job>> {
        self.store
            .find_by_owner_excluding_statuses(email, &FINAL_STATES)
            .await
    }

    /// Marks the job downloaded and returns where its result lives.
    pub async fn download(&self, id: Uuid) -> Result<PathBuf> {
        let job = self.get_job(id).await?;
        if !matches!(job.status, JobStatus::Ready | JobStatus::Downloaded) {
            return Err(CompressorError::InvalidStatus {
                job_id: id,
                status: job.status,
                operation: "download",
            });
        }
        self.store
            .apply(id, JobChange::Status(JobStatus::Downloaded))
            .await?;
        Ok(self.files.result_path(id))
    }

    /// Route one encode outcome to its finalization path.
    pub async fn finalize(&self, outcome: JobOutcome) -> Result<()> {
        match outcome {
            JobOutcome::Encoded {
                job_id,
                origin: JobOrigin::Local,
            } => self.finish_local(job_id).await,
            JobOutcome::Encoded {
                job_id,
                origin:
                    JobOrigin::Remote {
                        origin_id,
                        return_url,
                    },
            } => self.return_result(job_id, origin_id, &return_url).await,
            JobOutcome::Failed { job_id, error, .. } => {
                tracing::error!(job_id = %job_id, error = %error, "Failing job after encode error");
                self.fail_job(job_id).await
            }
        }
    }

    async fn finish_local(&self, job_id: Uuid) -> Result<()> {
        let compressed_size = self.files.result_size(job_id).await?;
        let job = self
            .store
            .apply(job_id, JobChange::Processed { compressed_size })
            .await?;
        self.files
            .delete_queue_file(job_id, "after processing", DeleteSeverity::Warn)
            .await;
        self.notify_owner_if_needed(&job).await
    }

    /// Worker side: push the result back to the master, then drop the local copy.
    async fn return_result(&self, job_id: Uuid, origin_id: Uuid, return_url: &str) -> Result<()> {
        let payload = self.files.result_path(job_id);
        if let Err(e) = self.remote.send_result(origin_id, payload, return_url).await {
            tracing::error!(
                job_id = %job_id,
                origin_id = %origin_id,
                error = %e,
                "Failed to send result to master, failing job"
            );
            return self.fail_job(job_id).await;
        }

        let compressed_size = self.files.result_size(job_id).await.unwrap_or(0);
        self.store
            .apply(job_id, JobChange::Processed { compressed_size })
            .await?;
        self.store
            .apply(job_id, JobChange::Status(JobStatus::Downloaded))
            .await?;
        self.store
            .apply(job_id, JobChange::Status(JobStatus::Deleted))
            .await?;
        self.files
            .delete_queue_file(job_id, "after submitting to master", DeleteSeverity::Warn)
            .await;
        self.files
            .delete_result_file(job_id, "after submitting to master", DeleteSeverity::Warn)
            .await;
        tracing::info!(job_id = %job_id, origin_id = %origin_id, "Result delivered to master");
        Ok(())
    }

    /// Master side: a worker finished a job this node dispatched.
    pub async fn accept_remote_result<R>(&self, job_id: Uuid, body: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let job = match self.store.find_by_id(job_id).await? {
            Some(job) => job,
            None => {
                tracing::error!(job_id = %job_id, "Result received for unknown job");
                return Err(CompressorError::JobNotFound(job_id));
            }
        };
        if job.status != JobStatus::Processing || job.node.is_local() {
            tracing::warn!(
                job_id = %job_id,
                status = %job.status,
                node = %job.node,
                "Refusing result for job not running remotely"
            );
            return Err(CompressorError::InvalidStatus {
                job_id,
                status: job.status,
                operation: "accept a result",
            });
        }

        let compressed_size = self.files.save_to_results(job_id, body).await?;
        let job = self
            .store
            .apply(job_id, JobChange::Processed { compressed_size })
            .await?;
        self.files
            .delete_queue_file(job_id, "after receiving result from worker", DeleteSeverity::Warn)
            .await;
        self.notify_owner_if_needed(&job).await?;

        if let Err(e) = self.queue.dispatch_next().await {
            tracing::info!(error = %e, "Failed to advance queue after accepting a result");
        }
        Ok(())
    }

    /// ERROR the job and tell its owner, if it has one.
    pub async fn fail_job(&self, job_id: Uuid) -> Result<()> {
        let job = self
            .store
            .apply(job_id, JobChange::Status(JobStatus::Error))
            .await?;
        tracing::info!(job_id = %job_id, "Job failed");
        if job.email.is_empty() {
            tracing::warn!(job_id = %job_id, "Job has no owner email, nobody to notify");
            return Ok(());
        }

        if let Err(e) = self.notifier.job_failed(&job.email, &job).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to send failure notification");
        }
        self.send_batch(&job.email).await?;
        Ok(())
    }

    /// Notify now if this was the owner's last job in flight, otherwise defer.
    pub async fn notify_owner_if_needed(&self, job: &Job) -> Result<()> {
        if job.email.is_empty() {
            return Ok(());
        }
        if self.store.count_in_queue_for_owner(&job.email).await? == 0 {
            self.send_batch(&job.email).await?;
        } else {
            tracing::info!(
                job_id = %job.id,
                "Deferring notification, owner has more jobs in queue"
            );
            self.store
                .apply(job.id, JobChange::Status(JobStatus::EmailPending))
                .await?;
        }
        Ok(())
    }

    /// One notification for every finished job of `email`, all of which become READY.
    /// Returns how many jobs were covered.
    pub async fn send_batch(&self, email: &str) -> Result<usize> {
        let pending = self
            .store
            .find_by_owner_and_statuses(email, &NOTIFICATION_PENDING_STATES)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        self.notifier.jobs_ready(email, &pending).await?;
        let moved = self
            .store
            .transition_owner_jobs(email, &NOTIFICATION_PENDING_STATES, JobStatus::Ready)
            .await?;
        tracing::info!(count = moved.len(), "Owner notified, jobs ready");
        Ok(moved.len())
    }

    /// Whether neither this node nor any worker could take an upload of `size` bytes.
    pub async fn is_queue_full(&self, size: u64) -> bool {
        if self.queue.has_local_headroom(size).await {
            return false;
        }
        if self.config.cluster.master_key.is_none() {
            return true;
        }
        for worker in &self.config.cluster.workers {
            match self.store.get_or_create_worker(&worker.host).await {
                Ok(record) if record.is_up() => {}
                _ => continue,
            }
            match self.remote.queue_status(&worker.host).await {
                Ok(status) if status.has_capacity() => return false,
                Ok(_) => {}
                Err(e) => tracing::debug!(host = %worker.host, error = %e, "Worker status unavailable"),
            }
        }
        true
    }

    /// What this node reports to masters about its own queue.
    pub async fn worker_queue_status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus {
            size: self.store.count_in_queue().await?,
            max_size: self.config.queue.max_queue_size,
            is_disk_full: self.files.queue_free_mb() <= self.config.space.free_space_threshold_mb,
        })
    }

    /// Worker side: whether the job a master knows as `origin_id` is still being worked on.
    pub async fn is_remote_job_in_queue(&self, origin_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .find_by_origin_id(origin_id)
            .await?
            .map(|job| IN_QUEUE_STATES.contains(&job.status))
            .unwrap_or(false))
    }

    /// Resubmit a failed job's original upload, found at `path`, as a new job for the same owner.
    pub async fn resubmit_recovered(&self, failed: &Job, path: &Path) -> Result<UploadAdmission> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        tracing::info!(job_id = %failed.id, "Resubmitting recovered upload");
        self.submit_upload(&failed.name, &failed.email, size, &mut file)
            .await
    }
}

/// Runs finalization for encode outcomes with bounded concurrency until shutdown.
pub fn spawn_finalizer(
    service: Arc<JobService>,
    mut outcomes: mpsc::UnboundedReceiver<JobOutcome>,
    concurrency: usize,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    tokio::spawn(async move {
        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = outcomes.recv() => match next {
                    Some(outcome) => outcome,
                    None => break,
                },
            };
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let job_id = outcome.job_id();
                if let Err(e) = service.finalize(outcome).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to finalize job");
                }
                drop(permit);
            });
        }
        tracing::info!("Finalizer stopped");
    })
}
