//! Persistence boundary for job and worker records.
//!
//! The scheduler only depends on the query shapes below, so any backend that can
//! filter by status, age, owner and node can sit behind [`JobStore`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::{Job, JobChange, JobStatus, NewJob, NodeRef, WorkerNode};

pub use memory::InMemoryJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates a record in UPLOADING.
    async fn create_job(&self, new: NewJob) -> Result<Job>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>>;

    async fn find_by_origin_id(&self, origin_id: Uuid) -> Result<Option<Job>>;

    /// Jobs in UPLOADING, UPLOADED, IN_QUEUE or PROCESSING.
    async fn count_in_queue(&self) -> Result<usize>;

    async fn count_in_queue_for_owner(&self, email: &str) -> Result<usize>;

    async fn find_by_status_updated_before(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>>;

    async fn find_by_statuses_updated_before(
        &self,
        statuses: &[JobStatus],
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>>;

    async fn find_excluding_statuses_updated_before(
        &self,
        excluded: &[JobStatus],
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>>;

    async fn find_by_status_and_node(&self, status: JobStatus, node: &NodeRef)
        -> Result<Vec<Job>>;

    /// PROCESSING jobs assigned to any remote node.
    async fn find_processing_on_remote_nodes(&self) -> Result<Vec<Job>>;

    async fn find_by_owner_and_statuses(
        &self,
        email: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<Job>>;

    async fn find_by_owner_excluding_statuses(
        &self,
        email: &str,
        excluded: &[JobStatus],
    ) -> Result<Vec<Job>>;

    /// Read-modify-write of a single record. Fails with `IllegalTransition` if the
    /// state machine has no such edge from the current status.
    async fn apply(&self, id: Uuid, change: JobChange) -> Result<Job>;

    /// Moves every job of `email` currently in one of `from` to `to`.
    /// Returns the jobs that moved.
    async fn transition_owner_jobs(
        &self,
        email: &str,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<Vec<Job>>;

    /// Writes progress unless it equals the last value written for this job.
    /// Returns whether a write happened.
    async fn update_progress(&self, id: Uuid, progress: u8, speed: f32) -> Result<bool>;

    async fn get_or_create_worker(&self, host: &str) -> Result<WorkerNode>;

    async fn save_worker(&self, worker: &WorkerNode) -> Result<()>;

    async fn set_worker_queue_size(&self, host: &str, queue_size: usize) -> Result<()>;
}
