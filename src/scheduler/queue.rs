use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{CompressorError, RejectionReason, Result};
use crate::files::{DeleteSeverity, FileStore};
use crate::remote::{OutboundWork, RemoteNodeClient};
use crate::scheduler::assigner::{self, Candidate};
use crate::scheduler::job::{Job, JobChange, JobStatus, NodeRef};
use crate::space::SpaceAccountant;
use crate::store::JobStore;
use crate::worker::{Progress, Transcoder};

/// Where a job entered the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOrigin {
    Local,
    /// Pushed here by a master. Runs locally and is never forwarded onward.
    Remote { origin_id: Uuid, return_url: String },
}

impl JobOrigin {
    pub fn of(job: &Job) -> Self {
        match (&job.origin, job.origin_id) {
            (NodeRef::Remote(return_url), Some(origin_id)) => JobOrigin::Remote {
                origin_id,
                return_url: return_url.clone(),
            },
            _ => JobOrigin::Local,
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, JobOrigin::Remote { .. })
    }
}

/// An entry of the work list.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub file_name: String,
    pub origin: JobOrigin,
    /// Skip space and depth checks; the job was accepted once already.
    pub bypass_admission: bool,
}

impl QueuedJob {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            file_name: job.name.clone(),
            origin: JobOrigin::of(job),
            bypass_admission: false,
        }
    }

    pub fn bypassing_admission(mut self) -> Self {
        self.bypass_admission = true;
        self
    }
}

/// How a local encode ended. Consumed by the finalizer pool.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Encoded {
        job_id: Uuid,
        origin: JobOrigin,
    },
    Failed {
        job_id: Uuid,
        origin: JobOrigin,
        error: String,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobOutcome::Encoded { job_id, .. } | JobOutcome::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Where an admitted job ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    Dispatched(NodeRef),
    /// In the work list, waiting for a local slot.
    Waiting,
}

pub type Admission = std::result::Result<Accepted, RejectionReason>;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    executing: usize,
    /// Jobs some caller is placing right now. Nobody else touches them meanwhile.
    claimed: HashSet<Uuid>,
    /// A caller backed off from a claimed job; the claimant runs the queue again when done.
    recheck: bool,
}

enum Claim {
    Mine {
        queued: QueuedJob,
        /// This job plus everything executing or ahead of it in the list.
        ahead: usize,
        depth: usize,
    },
    Busy,
    Gone,
}

/// Admits jobs, picks a node for each and bounds local concurrency.
///
/// The work list and slot counter sit behind a short-lived lock that is never held
/// across a remote call. A job being placed is claimed in that state, so status
/// queries and pushes for different jobs run side by side while one job is never
/// placed twice.
pub struct WorkQueue {
    config: Arc<NodeConfig>,
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteNodeClient>,
    files: Arc<FileStore>,
    space: Arc<SpaceAccountant>,
    transcoder: Arc<dyn Transcoder>,
    state: Mutex<QueueState>,
    outcomes: mpsc::UnboundedSender<JobOutcome>,
}

impl WorkQueue {
    /// Returns the queue and the receiving end of local encode outcomes.
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteNodeClient>,
        files: Arc<FileStore>,
        space: Arc<SpaceAccountant>,
        transcoder: Arc<dyn Transcoder>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<JobOutcome>) {
        let (outcomes, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            config,
            store,
            remote,
            files,
            space,
            transcoder,
            state: Mutex::new(QueueState::default()),
            outcomes,
        });
        (queue, rx)
    }

    /// Admit a job and try to place it right away.
    pub async fn submit(self: &Arc<Self>, queued: QueuedJob) -> Result<Admission> {
        let job_id = queued.job_id;
        if !queued.bypass_admission {
            let available = self.space.available_mb();
            if available <= self.config.space.minimum_space_remaining_mb {
                tracing::warn!(job_id = %job_id, available_mb = available, "Not enough space, rejecting job");
                self.reject(job_id).await?;
                return Ok(Err(RejectionReason::NotEnoughSpace));
            }
        }

        self.store
            .apply(job_id, JobChange::Status(JobStatus::InQueue))
            .await?;
        let admitted = queued.bypass_admission;
        self.push(queued).await;
        self.dispatch(job_id, admitted).await
    }

    /// Put a job orphaned by `from` back on the work list.
    ///
    /// Returns `None` without touching the job if it is no longer PROCESSING on `from`,
    /// for instance because another check already moved it elsewhere.
    pub async fn reinsert(
        self: &Arc<Self>,
        job_id: Uuid,
        from: &NodeRef,
        bypass_admission: bool,
    ) -> Result<Option<Admission>> {
        let change = JobChange::Requeued { from: from.clone() };
        let job = match self.store.apply(job_id, change).await {
            Ok(job) => job,
            Err(CompressorError::IllegalTransition { from: status, .. }) => {
                tracing::info!(
                    job_id = %job_id,
                    node = %from,
                    status = %status,
                    "Job moved on since it was orphaned, not reinserting"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let mut queued = QueuedJob::from_job(&job);
        queued.bypass_admission = bypass_admission;
        tracing::info!(job_id = %job_id, node = %from, bypass_admission, "Reinserting job");
        self.submit(queued).await.map(Some)
    }

    /// Try to place the first waiting job nobody else is placing.
    /// No-op when the list is empty.
    pub async fn dispatch_next(self: &Arc<Self>) -> Result<()> {
        let next = {
            let mut state = self.state.lock().await;
            let next = state
                .pending
                .iter()
                .map(|q| q.job_id)
                .find(|id| !state.claimed.contains(id));
            if next.is_none() && !state.pending.is_empty() {
                state.recheck = true;
            }
            next
        };
        if let Some(job_id) = next {
            self.dispatch(job_id, true).await?;
        }
        Ok(())
    }

    /// Re-run placement for every waiting job so a newly available worker can take some.
    /// Returns how many jobs were dispatched.
    pub async fn reset_queue(self: &Arc<Self>) -> Result<usize> {
        let waiting: Vec<Uuid> = self
            .state
            .lock()
            .await
            .pending
            .iter()
            .map(|q| q.job_id)
            .collect();
        if waiting.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = waiting.len(), "Resetting queue");

        let mut dispatched = 0;
        for job_id in waiting {
            match self.dispatch(job_id, true).await {
                Ok(Ok(Accepted::Dispatched(_))) => dispatched += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to redispatch job"),
            }
        }
        Ok(dispatched)
    }

    /// Requeue every job believed to be PROCESSING on `host`. Returns how many were requeued.
    pub async fn reassign_work_from_dead_node(self: &Arc<Self>, host: &str) -> Result<usize> {
        let orphaned = self
            .store
            .find_by_status_and_node(JobStatus::Processing, &NodeRef::Remote(host.to_string()))
            .await?;
        if orphaned.is_empty() {
            return Ok(0);
        }
        tracing::warn!(host = %host, count = orphaned.len(), "Reassigning work from dead node");

        let mut reassigned = 0;
        for job in orphaned {
            match self.reinsert(job.id, &job.node, true).await {
                Ok(Some(_)) => reassigned += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(job_id = %job.id, host = %host, error = %e, "Failed to reassign job"),
            }
        }
        Ok(reassigned)
    }

    /// Jobs waiting plus jobs encoding locally.
    pub async fn depth(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.executing
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn executing(&self) -> usize {
        self.state.lock().await.executing
    }

    pub async fn is_waiting(&self, job_id: Uuid) -> bool {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .any(|q| q.job_id == job_id)
    }

    /// Whether this node alone could admit one more job of `size_bytes`.
    pub async fn has_local_headroom(&self, size_bytes: u64) -> bool {
        let size_mb = (size_bytes / crate::space::MB) as i64;
        let space_ok =
            self.space.available_mb() - size_mb > self.config.space.minimum_space_remaining_mb;
        space_ok && self.depth().await < self.config.queue.max_queue_size
    }

    async fn push(&self, queued: QueuedJob) {
        let mut state = self.state.lock().await;
        if !state.pending.iter().any(|q| q.job_id == queued.job_id) {
            state.pending.push_back(queued);
        }
    }

    async fn remove_pending(&self, job_id: Uuid) {
        self.state
            .lock()
            .await
            .pending
            .retain(|q| q.job_id != job_id);
    }

    async fn dispatch(self: &Arc<Self>, job_id: Uuid, admitted: bool) -> Result<Admission> {
        let claim = {
            let mut state = self.state.lock().await;
            let position = state.pending.iter().position(|q| q.job_id == job_id);
            match position {
                Some(_) if state.claimed.contains(&job_id) => {
                    state.recheck = true;
                    Claim::Busy
                }
                Some(position) => {
                    state.claimed.insert(job_id);
                    Claim::Mine {
                        queued: state.pending[position].clone(),
                        ahead: state.executing + position + 1,
                        depth: state.executing + state.pending.len(),
                    }
                }
                None => Claim::Gone,
            }
        };

        let placed = match claim {
            Claim::Mine {
                queued,
                ahead,
                depth,
            } => self.place(&queued, ahead, depth, admitted).await,
            // someone else is placing it or placed it already
            Claim::Busy | Claim::Gone => return Ok(Ok(self.placement_of(job_id).await?)),
        };

        let recheck = {
            let mut state = self.state.lock().await;
            state.claimed.remove(&job_id);
            std::mem::take(&mut state.recheck)
        };
        if recheck {
            self.schedule_dispatch();
        }
        placed
    }

    /// Placement of a claimed job. Runs without any lock held except for the
    /// short state flips in `dispatch_local` and `dispatch_remote`.
    async fn place(
        self: &Arc<Self>,
        queued: &QueuedJob,
        ahead: usize,
        depth: usize,
        admitted: bool,
    ) -> Result<Admission> {
        let job_id = queued.job_id;
        match self.store.find_by_id(job_id).await? {
            Some(job) if job.status == JobStatus::InQueue => {}
            Some(job) => {
                self.remove_pending(job_id).await;
                return Err(CompressorError::InvalidStatus {
                    job_id,
                    status: job.status,
                    operation: "dispatch",
                });
            }
            None => {
                self.remove_pending(job_id).await;
                return Err(CompressorError::JobNotFound(job_id));
            }
        }

        let already_admitted = admitted || queued.bypass_admission;
        let mut candidates = Vec::new();
        if already_admitted || ahead <= self.config.queue.max_queue_size {
            candidates.push(Candidate::local(depth));
        } else {
            tracing::info!(job_id = %job_id, depth = ahead, "Local node won't compete for job: queue full");
        }
        if !queued.origin.is_pinned() && self.config.cluster.master_key.is_some() {
            candidates.extend(self.remote_candidates().await);
        }

        for candidate in assigner::rank(candidates) {
            let attempt = match &candidate.node {
                NodeRef::Local => self.dispatch_local(queued).await,
                NodeRef::Remote(host) => self
                    .dispatch_remote(queued, host)
                    .await
                    .map(|()| Accepted::Dispatched(candidate.node.clone())),
            };
            match attempt {
                Ok(accepted) => return Ok(Ok(accepted)),
                Err(e) => tracing::warn!(
                    job_id = %job_id,
                    node = %candidate.node,
                    error = %e,
                    "Dispatch attempt failed, moving on"
                ),
            }
        }

        if already_admitted {
            tracing::warn!(job_id = %job_id, "No node took admitted job, leaving it queued");
            return Ok(Ok(Accepted::Waiting));
        }

        tracing::warn!(job_id = %job_id, "No available node for job, rejecting");
        self.remove_pending(job_id).await;
        self.reject(job_id).await?;
        Ok(Err(RejectionReason::QueueFull))
    }

    /// Runs `dispatch_next` on its own task.
    fn schedule_dispatch(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = queue.dispatch_next().await {
                tracing::warn!(error = %e, "Failed to advance queue");
            }
        });
    }

    async fn placement_of(&self, job_id: Uuid) -> Result<Accepted> {
        let job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or(CompressorError::JobNotFound(job_id))?;
        Ok(if job.status == JobStatus::Processing {
            Accepted::Dispatched(job.node)
        } else {
            Accepted::Waiting
        })
    }

    /// Workers that are UP and report spare capacity, scored by fresh queue status.
    async fn remote_candidates(&self) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for worker in &self.config.cluster.workers {
            let record = match self.store.get_or_create_worker(&worker.host).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(host = %worker.host, error = %e, "Failed to load worker record");
                    continue;
                }
            };
            if !record.is_up() {
                continue;
            }

            let status = match self.remote.queue_status(&worker.host).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::info!(
                        host = %worker.host,
                        error = %e,
                        "Failed to fetch worker status, not sending work to it"
                    );
                    continue;
                }
            };
            if let Err(e) = self
                .store
                .set_worker_queue_size(&worker.host, status.size)
                .await
            {
                tracing::warn!(host = %worker.host, error = %e, "Failed to record worker queue size");
            }
            if !status.has_capacity() {
                tracing::debug!(host = %worker.host, ?status, "Worker has no capacity");
                continue;
            }
            candidates.push(Candidate::remote(&worker.host, status.size, worker.efficiency));
        }
        candidates
    }

    async fn dispatch_local(self: &Arc<Self>, queued: &QueuedJob) -> Result<Accepted> {
        {
            let mut state = self.state.lock().await;
            if state.executing >= self.config.queue.max_concurrent_local_jobs {
                tracing::debug!(job_id = %queued.job_id, "No free local slot, job waits");
                return Ok(Accepted::Waiting);
            }
            state.executing += 1;
            state.pending.retain(|q| q.job_id != queued.job_id);
        }

        let marked = self
            .store
            .apply(
                queued.job_id,
                JobChange::Processing {
                    node: NodeRef::Local,
                },
            )
            .await;
        if let Err(e) = marked {
            self.release_slot().await;
            return Err(e);
        }

        tracing::info!(job_id = %queued.job_id, "Job dispatched locally");
        self.start_local(queued.clone());
        Ok(Accepted::Dispatched(NodeRef::Local))
    }

    async fn dispatch_remote(&self, queued: &QueuedJob, host: &str) -> Result<()> {
        if self.config.cluster.master_key.is_none() {
            tracing::error!(job_id = %queued.job_id, "Attempted remote dispatch without a master key");
            return Err(CompressorError::RemoteExecutionInvocation(
                "cannot execute job remotely without a master key".to_string(),
            ));
        }

        let work = OutboundWork {
            job_id: queued.job_id,
            file_name: queued.file_name.clone(),
            payload: self.files.queue_path(queued.job_id),
            return_url: self.config.return_url(),
        };
        self.remote.send_work(host, &work).await?;

        // only once the worker acknowledged the push
        self.remove_pending(queued.job_id).await;
        self.store
            .apply(
                queued.job_id,
                JobChange::Processing {
                    node: NodeRef::Remote(host.to_string()),
                },
            )
            .await?;
        // keep the recorded depth honest until the next status query
        match self.store.get_or_create_worker(host).await {
            Ok(record) => {
                if let Err(e) = self
                    .store
                    .set_worker_queue_size(host, record.queue_size + 1)
                    .await
                {
                    tracing::warn!(host = %host, error = %e, "Failed to record worker queue size");
                }
            }
            Err(e) => tracing::warn!(host = %host, error = %e, "Failed to load worker record"),
        }
        tracing::info!(job_id = %queued.job_id, host = %host, "Job dispatched to worker");
        Ok(())
    }

    async fn reject(&self, job_id: Uuid) -> Result<()> {
        self.store
            .apply(job_id, JobChange::Status(JobStatus::Rejected))
            .await?;
        self.files
            .delete_queue_file(job_id, "rejected", DeleteSeverity::Warn)
            .await;
        Ok(())
    }

    async fn release_slot(&self) {
        let mut state = self.state.lock().await;
        state.executing = state.executing.saturating_sub(1);
    }

    fn start_local(self: &Arc<Self>, queued: QueuedJob) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = queue.run_encode(&queued).await;
            queue.release_slot().await;
            if queue.outcomes.send(outcome).is_err() {
                tracing::warn!(job_id = %queued.job_id, "Finalizer stopped, outcome dropped");
            }
            if let Err(e) = queue.dispatch_next().await {
                tracing::warn!(error = %e, "Failed to advance queue after encode");
            }
        });
    }

    async fn run_encode(&self, queued: &QueuedJob) -> JobOutcome {
        let job_id = queued.job_id;
        let input = self.files.queue_path(job_id);
        let output = self.files.result_path(job_id);

        let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
        let store = Arc::clone(&self.store);
        let progress = tokio::spawn(async move {
            while let Some(p) = rx.recv().await {
                if let Err(e) = store.update_progress(job_id, p.percent, p.speed).await {
                    tracing::debug!(job_id = %job_id, error = %e, "Failed to store progress");
                }
            }
        });

        let result = self.transcoder.transcode(job_id, &input, &output, tx).await;
        let _ = progress.await;

        match result {
            Ok(()) => JobOutcome::Encoded {
                job_id,
                origin: queued.origin.clone(),
            },
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Encode failed");
                JobOutcome::Failed {
                    job_id,
                    origin: queued.origin.clone(),
                    error: e.to_string(),
                }
            }
        }
    }
}
