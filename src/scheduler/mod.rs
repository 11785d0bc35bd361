//! Job scheduling: the job state machine, the Work Queue and its dispatch ranking,
//! plus the background passes that keep queue state honest.

pub mod assigner;
pub mod health;
pub mod integrity;
pub mod job;
pub mod queue;
pub mod sweeps;
pub mod worker_node;

pub use health::{HealthMonitor, HealthReport};
pub use integrity::IntegrityChecker;
pub use job::{Job, JobChange, JobStatus, NewJob, NodeRef};
pub use queue::{Accepted, Admission, JobOrigin, JobOutcome, QueuedJob, WorkQueue};
pub use sweeps::Sweeper;
pub use worker_node::{WorkerNode, WorkerStatus};
