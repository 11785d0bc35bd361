use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a transcoding job.
///
/// The happy path is `Uploading -> Uploaded -> InQueue -> Processing -> Processed ->
/// (EmailPending ->) Ready -> Downloaded -> Deleted`. `Error` is reachable from every
/// non-final state; `Rejected` only before a job has been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Uploading,
    Uploaded,
    InQueue,
    Processing,
    Processed,
    EmailPending,
    Ready,
    Downloaded,
    Deleted,
    DeletedWithoutDownloading,
    Error,
    Rejected,
}

/// States a job occupies while it still counts against queue depth.
pub const IN_QUEUE_STATES: [JobStatus; 4] = [
    JobStatus::Uploading,
    JobStatus::Uploaded,
    JobStatus::InQueue,
    JobStatus::Processing,
];

/// States that should only last moments. Lingering here means a crash mid-pipeline.
pub const TRANSITIVE_STATES: [JobStatus; 2] = [JobStatus::Uploaded, JobStatus::Processed];

/// Jobs in these states are never touched again by the stale sweep.
pub const FINAL_STATES: [JobStatus; 4] = [
    JobStatus::Rejected,
    JobStatus::Deleted,
    JobStatus::DeletedWithoutDownloading,
    JobStatus::Error,
];

/// Finished jobs whose owner has not been told yet.
pub const NOTIFICATION_PENDING_STATES: [JobStatus; 2] =
    [JobStatus::EmailPending, JobStatus::Processed];

impl JobStatus {
    pub fn is_final(self) -> bool {
        FINAL_STATES.contains(&self)
    }

    /// Whether the state machine has an edge from `self` to `next`.
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self == next {
            return true;
        }
        if next == Error {
            return !matches!(self, Deleted | DeletedWithoutDownloading | Rejected);
        }
        match self {
            Uploading => matches!(next, Uploaded | Rejected),
            Uploaded => matches!(next, InQueue | Rejected),
            InQueue => matches!(next, Processing | Rejected),
            // back to InQueue when a worker loses the job
            Processing => matches!(next, Processed | InQueue),
            // Downloaded: a worker's copy of a remote job once the origin has the result
            Processed => matches!(next, EmailPending | Ready | Downloaded),
            EmailPending => matches!(next, Ready),
            Ready => matches!(next, Downloaded | DeletedWithoutDownloading),
            Downloaded => matches!(next, Deleted),
            Deleted | DeletedWithoutDownloading | Error | Rejected => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Uploading => "UPLOADING",
            JobStatus::Uploaded => "UPLOADED",
            JobStatus::InQueue => "IN_QUEUE",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Processed => "PROCESSED",
            JobStatus::EmailPending => "EMAIL_PENDING",
            JobStatus::Ready => "READY",
            JobStatus::Downloaded => "DOWNLOADED",
            JobStatus::Deleted => "DELETED",
            JobStatus::DeletedWithoutDownloading => "DELETED_WITHOUT_DOWNLOADING",
            JobStatus::Error => "ERROR",
            JobStatus::Rejected => "REJECTED",
        };
        f.pad(s)
    }
}

/// A node that can run or originate a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "host", rename_all = "lowercase")]
pub enum NodeRef {
    Local,
    Remote(String),
}

impl NodeRef {
    pub fn is_local(&self) -> bool {
        matches!(self, NodeRef::Local)
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            NodeRef::Local => None,
            NodeRef::Remote(host) => Some(host),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRef::Local => write!(f, "local"),
            NodeRef::Remote(host) => write!(f, "{}", host),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    /// Empty for jobs pushed to this node by a master.
    pub email: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub progress: u8,
    pub speed: f32,
    pub status: JobStatus,
    pub node: NodeRef,
    pub origin: NodeRef,
    /// Id of this job on its origin node. Set iff `origin` is remote.
    pub origin_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create a job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub email: String,
    pub size: u64,
    pub origin: NodeRef,
    pub origin_id: Option<Uuid>,
}

impl NewJob {
    /// A job uploaded directly to this node by its owner.
    pub fn local(name: impl Into<String>, email: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            size,
            origin: NodeRef::Local,
            origin_id: None,
        }
    }

    /// A job pushed to this node by the master at `origin`.
    pub fn from_master(
        name: impl Into<String>,
        size: u64,
        origin: impl Into<String>,
        origin_id: Uuid,
    ) -> Self {
        Self {
            name: name.into(),
            email: String::new(),
            size,
            origin: NodeRef::Remote(origin.into()),
            origin_id: Some(origin_id),
        }
    }
}

impl Job {
    pub fn new(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: new.name,
            email: new.email,
            original_size: new.size,
            compressed_size: 0,
            progress: 0,
            speed: 0.0,
            status: JobStatus::Uploading,
            node: NodeRef::Local,
            origin: new.origin,
            origin_id: new.origin_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_remote_origin(&self) -> bool {
        !self.origin.is_local()
    }

    /// Apply a change if the state machine allows it. Refreshes `updated_at`.
    pub fn apply(&mut self, change: &JobChange) -> bool {
        let target = change.target_status();
        if !self.status.can_transition_to(target) {
            return false;
        }
        if let JobChange::Requeued { from } = change {
            // only the node the caller saw it on may give the job up
            if self.status != JobStatus::Processing || self.node != *from {
                return false;
            }
        }
        match change {
            JobChange::Uploaded { original_size } => self.original_size = *original_size,
            JobChange::Processing { node } => self.node = node.clone(),
            JobChange::Processed { compressed_size } => {
                self.compressed_size = *compressed_size;
                self.progress = 100;
            }
            JobChange::Requeued { .. } => self.node = NodeRef::Local,
            JobChange::Status(_) => {}
        }
        self.status = target;
        self.updated_at = Utc::now();
        true
    }
}

/// A single mutation of a job record, always tied to a target status.
#[derive(Debug, Clone, PartialEq)]
pub enum JobChange {
    Uploaded { original_size: u64 },
    Processing { node: NodeRef },
    Processed { compressed_size: u64 },
    /// Back to the work list after `from` lost it.
    Requeued { from: NodeRef },
    Status(JobStatus),
}

impl JobChange {
    pub fn target_status(&self) -> JobStatus {
        match self {
            JobChange::Uploaded { .. } => JobStatus::Uploaded,
            JobChange::Processing { .. } => JobStatus::Processing,
            JobChange::Processed { .. } => JobStatus::Processed,
            JobChange::Requeued { .. } => JobStatus::InQueue,
            JobChange::Status(status) => *status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges() {
        use JobStatus::*;
        let path = [
            Uploading, Uploaded, InQueue, Processing, Processed, EmailPending, Ready, Downloaded,
            Deleted,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Processed.can_transition_to(Ready));
        assert!(Ready.can_transition_to(DeletedWithoutDownloading));
    }

    #[test]
    fn no_backwards_or_skipping_edges() {
        use JobStatus::*;
        assert!(!Uploading.can_transition_to(Processing));
        assert!(!InQueue.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(InQueue));
        assert!(!Downloaded.can_transition_to(DeletedWithoutDownloading));
        assert!(!Processing.can_transition_to(Rejected));
        assert!(!Error.can_transition_to(InQueue));
    }

    #[test]
    fn error_reachable_from_non_final_states() {
        use JobStatus::*;
        for s in [
            Uploading, Uploaded, InQueue, Processing, Processed, EmailPending, Ready, Downloaded,
        ] {
            assert!(s.can_transition_to(Error), "{} -> ERROR", s);
        }
        for s in [Deleted, DeletedWithoutDownloading, Rejected] {
            assert!(!s.can_transition_to(Error), "{} -> ERROR", s);
        }
    }

    #[test]
    fn terminal_states_are_closed() {
        use JobStatus::*;
        for s in [Deleted, DeletedWithoutDownloading, Rejected] {
            assert!(!s.can_transition_to(Ready));
            assert!(!s.can_transition_to(InQueue));
            assert!(s.can_transition_to(s));
        }
    }

    #[test]
    fn apply_refuses_illegal_change() {
        let mut job = Job::new(NewJob::local("a.mov", "me@example.com", 10));
        assert!(!job.apply(&JobChange::Processed { compressed_size: 1 }));
        assert_eq!(job.status, JobStatus::Uploading);
        assert_eq!(job.compressed_size, 0);
    }

    #[test]
    fn apply_sets_fields() {
        let mut job = Job::new(NewJob::local("a.mov", "me@example.com", 10));
        let before = job.updated_at;
        assert!(job.apply(&JobChange::Uploaded { original_size: 42 }));
        assert!(job.apply(&JobChange::Status(JobStatus::InQueue)));
        assert!(job.apply(&JobChange::Processing {
            node: NodeRef::Remote("http://w1".into())
        }));
        assert_eq!(job.original_size, 42);
        assert_eq!(job.node.host(), Some("http://w1"));
        assert!(job.updated_at >= before);

        assert!(job.apply(&JobChange::Requeued {
            from: NodeRef::Remote("http://w1".into())
        }));
        assert_eq!(job.status, JobStatus::InQueue);
        assert!(job.node.is_local());
    }

    #[test]
    fn requeue_only_from_the_current_node() {
        let mut job = Job::new(NewJob::local("a.mov", "me@example.com", 10));
        job.status = JobStatus::Processing;
        job.node = NodeRef::Remote("http://w2".into());

        let stale = JobChange::Requeued {
            from: NodeRef::Remote("http://w1".into()),
        };
        assert!(!job.apply(&stale));
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.node.host(), Some("http://w2"));

        job.status = JobStatus::InQueue;
        job.node = NodeRef::Local;
        assert!(!job.apply(&JobChange::Requeued {
            from: NodeRef::Local
        }));
    }

    #[test]
    fn origin_id_only_for_remote_origin() {
        let local = Job::new(NewJob::local("a", "e", 1));
        assert!(local.origin_id.is_none());
        assert!(!local.is_remote_origin());

        let id = Uuid::new_v4();
        let remote = Job::new(NewJob::from_master("a", 1, "master", id));
        assert_eq!(remote.origin_id, Some(id));
        assert!(remote.email.is_empty());
        assert!(remote.is_remote_origin());
    }

    #[test]
    fn status_display_matches_wire_names() {
        assert_eq!(JobStatus::EmailPending.to_string(), "EMAIL_PENDING");
        assert_eq!(
            serde_json::to_string(&JobStatus::DeletedWithoutDownloading).unwrap(),
            "\"DELETED_WITHOUT_DOWNLOADING\""
        );
    }
}
