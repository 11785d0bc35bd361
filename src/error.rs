use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum CompressorError {
    #[error("Processing queue is currently full: not enough space. Try again later.")]
    NotEnoughSpace,

    #[error("Processing queue is currently full. Try again later.")]
    QueueFull,

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {job_id} is {status}, cannot {operation}")]
    InvalidStatus {
        job_id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Job {job_id} cannot move from {from} to {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Remote execution unavailable: {0}")]
    RemoteExecutionInvocation(String),

    #[error("Master key not authorized")]
    MasterNotAuthorized,

    #[error("Worker mode is disabled on this node")]
    WorkerModeNotAllowed,

    #[error("Remote node {host} failed: {message}")]
    Remote { host: String, message: String },

    #[error("Transcoding failed: {0}")]
    Transcode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CompressorError {
    /// Short machine-readable name used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CompressorError::NotEnoughSpace => "NotEnoughSpace",
            CompressorError::QueueFull => "QueueFull",
            CompressorError::JobNotFound(_) => "EntityNotFound",
            CompressorError::InvalidStatus { .. } => "InvalidStatus",
            CompressorError::IllegalTransition { .. } => "InvalidStatus",
            CompressorError::RemoteExecutionInvocation(_) => "RemoteExecutionInvocation",
            CompressorError::MasterNotAuthorized => "MasterNotAuthorized",
            CompressorError::WorkerModeNotAllowed => "WorkerModeNotAllowed",
            CompressorError::Remote { .. } | CompressorError::Http(_) => "RemoteFailure",
            CompressorError::Transcode(_) => "TranscodeFailure",
            CompressorError::BadRequest(_) => "BadRequest",
            CompressorError::Io(_)
            | CompressorError::Config(_)
            | CompressorError::Internal(_) => "InternalServerError",
        }
    }
}

/// Why the admission check turned a job away. Both cases are retryable by the caller later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    NotEnoughSpace,
    QueueFull,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::NotEnoughSpace => write!(f, "not enough space"),
            RejectionReason::QueueFull => write!(f, "queue full"),
        }
    }
}

impl From<RejectionReason> for CompressorError {
    fn from(reason: RejectionReason) -> Self {
        match reason {
            RejectionReason::NotEnoughSpace => CompressorError::NotEnoughSpace,
            RejectionReason::QueueFull => CompressorError::QueueFull,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompressorError>;
