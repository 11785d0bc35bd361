use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::files::FileStore;
use crate::notify::{LogNotifier, Notifier};
use crate::remote::{HttpNodeClient, RemoteNodeClient};
use crate::scheduler::{HealthMonitor, IntegrityChecker, JobOutcome, Sweeper, WorkQueue};
use crate::service::{spawn_finalizer, JobService};
use crate::space::SpaceAccountant;
use crate::store::{InMemoryJobStore, JobStore};
use crate::worker::{FfmpegTranscoder, Transcoder};

/// One compressor node: the job API, the Work Queue, and the periodic passes around it.
pub struct Node {
    pub config: Arc<NodeConfig>,
    pub store: Arc<dyn JobStore>,
    pub files: Arc<FileStore>,
    pub queue: Arc<WorkQueue>,
    pub service: Arc<JobService>,
    pub integrity: Arc<IntegrityChecker>,
    pub health: Arc<HealthMonitor>,
    pub sweeper: Arc<Sweeper>,
    outcomes: Option<mpsc::UnboundedReceiver<JobOutcome>>,
}

impl Node {
    /// Production wiring: in-memory job records, local disks, HTTP to peers, ffmpeg.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let remote = Arc::new(HttpNodeClient::new(
            config.cluster.master_key.clone(),
            config.network.clone(),
        )?);
        let files = Arc::new(FileStore::new(&config.paths));
        let transcoder = Arc::new(FfmpegTranscoder::new(config.encoder.clone()));
        let notifier = Arc::new(LogNotifier::new(config.server.host_url.clone()));
        Ok(Self::with_components(
            config,
            Arc::new(InMemoryJobStore::new()),
            remote,
            files,
            transcoder,
            notifier,
        ))
    }

    pub fn with_components(
        config: NodeConfig,
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteNodeClient>,
        files: Arc<FileStore>,
        transcoder: Arc<dyn Transcoder>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = Arc::new(config);
        let space = Arc::new(SpaceAccountant::new(files.queue_volume()));
        let (queue, outcomes) = WorkQueue::new(
            config.clone(),
            store.clone(),
            remote.clone(),
            files.clone(),
            space.clone(),
            transcoder,
        );
        let service = Arc::new(JobService::new(
            config.clone(),
            store.clone(),
            files.clone(),
            space,
            queue.clone(),
            remote.clone(),
            notifier,
        ));
        let integrity = Arc::new(IntegrityChecker::new(
            store.clone(),
            remote.clone(),
            queue.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.clone(),
            store.clone(),
            remote,
            queue.clone(),
            integrity.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            config.clone(),
            store.clone(),
            files.clone(),
            service.clone(),
        ));

        Self {
            config,
            store,
            files,
            queue,
            service,
            integrity,
            health,
            sweeper,
            outcomes: Some(outcomes),
        }
    }

    /// Takes the encode outcome stream, leaving `run` without a finalizer.
    pub fn take_outcomes(&mut self) -> Option<mpsc::UnboundedReceiver<JobOutcome>> {
        self.outcomes.take()
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Creates the queue and results directories
    /// 2. Spawns the finalizer that turns encode outcomes into status changes
    /// 3. Spawns the worker health check and the queue integrity check
    /// 4. Spawns the reclamation sweeps; recovery also runs once right away
    /// 5. Runs the HTTP API (blocking)
    ///
    /// In-flight encodes are not waited for and their records are dropped with the
    /// in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created or the API server fails.
    /// Background tasks log their own errors and keep running.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.files.ensure_dirs().await?;

        let mut tasks = Vec::new();
        if let Some(outcomes) = self.outcomes.take() {
            tasks.push(spawn_finalizer(
                self.service.clone(),
                outcomes,
                self.config.queue.finalizer_concurrency,
                shutdown.clone(),
            ));
        }

        let schedule = &self.config.schedule;

        let health = self.health.clone();
        tasks.push(spawn_periodic(
            "health",
            schedule.health_check_secs,
            shutdown.clone(),
            move || {
                let health = health.clone();
                async move {
                    match health.check_workers().await {
                        Ok(report) if report.queue_reset || !report.declared_dead.is_empty() => {
                            tracing::info!(
                                came_up = ?report.came_up,
                                declared_dead = ?report.declared_dead,
                                reassigned = report.reassigned,
                                "Worker health changed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Worker health check failed"),
                    }
                }
            },
        ));

        let integrity = self.integrity.clone();
        tasks.push(spawn_periodic(
            "integrity",
            schedule.integrity_check_secs,
            shutdown.clone(),
            move || {
                let integrity = integrity.clone();
                async move {
                    match integrity.check_all().await {
                        Ok(0) => {}
                        Ok(requeued) => tracing::warn!(requeued, "Integrity check requeued lost jobs"),
                        Err(e) => tracing::error!(error = %e, "Integrity check failed"),
                    }
                }
            },
        ));

        macro_rules! sweep {
            ($name:literal, $secs:expr, $pass:ident) => {{
                let sweeper = self.sweeper.clone();
                tasks.push(spawn_periodic($name, $secs, shutdown.clone(), move || {
                    let sweeper = sweeper.clone();
                    async move {
                        let handled = sweeper.$pass(Utc::now()).await;
                        if handled > 0 {
                            tracing::info!(sweep = $name, handled, "Sweep finished");
                        }
                    }
                }));
            }};
        }
        sweep!("claimed", schedule.claimed_sweep_secs, reap_claimed);
        sweep!("unclaimed", schedule.unclaimed_sweep_secs, reap_unclaimed);
        sweep!("error", schedule.error_sweep_secs, reap_error_zombies);
        sweep!("transitive", schedule.transitive_sweep_secs, reap_transitive);
        sweep!("stale", schedule.stale_sweep_secs, reap_stale);

        let sweeper = self.sweeper.clone();
        tasks.push(spawn_periodic(
            "recovery",
            schedule.recovery_sweep_secs,
            shutdown.clone(),
            move || {
                let sweeper = sweeper.clone();
                async move {
                    let recovered = sweeper.recover_failed().await;
                    if recovered > 0 {
                        tracing::info!(recovered, "Recovery sweep finished");
                    }
                }
            },
        ));

        tracing::info!(
            addr = %self.config.server.listen_addr,
            host_url = %self.config.server.host_url,
            workers = self.config.cluster.workers.len(),
            remote_dispatch = self.config.cluster.master_key.is_some(),
            "Node started"
        );

        let served = api::serve(
            self.config.server.listen_addr,
            ApiState::new(self.service.clone()),
            shutdown.clone(),
        )
        .await;

        // the API may have failed on its own; stop the rest with it
        shutdown.cancel();
        for task in tasks {
            let _ = task.await;
        }
        served
    }
}

/// Runs `task` every `every_secs` seconds, starting immediately, until `shutdown`.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    every_secs: u64,
    shutdown: CancellationToken,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(every_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => task().await,
            }
        }
        tracing::debug!(task = name, "Periodic task stopped");
    })
}
