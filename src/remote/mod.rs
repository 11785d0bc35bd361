//! Calls from one node to another: liveness, queue status, work hand-off and result return.

pub mod http;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use http::HttpNodeClient;

pub const MASTER_KEY_HEADER: &str = "Master-Key";
pub const FILE_NAME_HEADER: &str = "File-Name";
pub const JOB_ID_HEADER: &str = "Job-Id";
pub const RETURN_URL_HEADER: &str = "Return-Url";

/// What a worker reports about its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub size: usize,
    pub max_size: usize,
    pub is_disk_full: bool,
}

impl QueueStatus {
    /// Whether the worker can take one more job.
    pub fn has_capacity(&self) -> bool {
        !self.is_disk_full && self.size < self.max_size
    }
}

/// A staged job handed to a worker.
#[derive(Debug, Clone)]
pub struct OutboundWork {
    pub job_id: Uuid,
    pub file_name: String,
    pub payload: PathBuf,
    /// Where the worker posts the finished result.
    pub return_url: String,
}

#[async_trait]
pub trait RemoteNodeClient: Send + Sync {
    /// Any failure or non-200 answer counts as down.
    async fn ping(&self, host: &str) -> bool;

    async fn queue_status(&self, host: &str) -> Result<QueueStatus>;

    /// Whether `host` still holds a job it received under `job_id`.
    async fn is_job_in_queue(&self, host: &str, job_id: Uuid) -> Result<bool>;

    /// Succeeds only once the worker has explicitly accepted the job.
    async fn send_work(&self, host: &str, work: &OutboundWork) -> Result<()>;

    /// Posts a finished result back to the node the job came from.
    async fn send_result(&self, origin_id: Uuid, payload: PathBuf, return_url: &str)
        -> Result<()>;
}
