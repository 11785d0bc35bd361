use std::sync::Arc;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::remote::RemoteNodeClient;
use crate::scheduler::integrity::IntegrityChecker;
use crate::scheduler::WorkQueue;
use crate::store::JobStore;

/// What one health round observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Workers that came up this round.
    pub came_up: Vec<String>,
    /// Workers that crossed the dead threshold this round.
    pub declared_dead: Vec<String>,
    pub reassigned: usize,
    pub queue_reset: bool,
}

/// Pings configured workers and keeps their UP/DOWN records current.
///
/// A failing worker is only declared dead after `down_pings_threshold` consecutive
/// failures; at that point its in-flight jobs are requeued once. A dead worker that
/// answers again is integrity-checked before it gets new work.
pub struct HealthMonitor {
    config: Arc<NodeConfig>,
    store: Arc<dyn JobStore>,
    remote: Arc<dyn RemoteNodeClient>,
    queue: Arc<WorkQueue>,
    integrity: Arc<IntegrityChecker>,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<dyn JobStore>,
        remote: Arc<dyn RemoteNodeClient>,
        queue: Arc<WorkQueue>,
        integrity: Arc<IntegrityChecker>,
    ) -> Self {
        Self {
            config,
            store,
            remote,
            queue,
            integrity,
        }
    }

    pub async fn check_workers(&self) -> Result<HealthReport> {
        let threshold = self.config.cluster.down_pings_threshold;
        let mut report = HealthReport::default();
        let mut new_worker_up = false;

        for worker in &self.config.cluster.workers {
            let host = worker.host.as_str();
            let mut record = self.store.get_or_create_worker(host).await?;
            let alive = self.remote.ping(host).await;

            // unchanged: healthy, or already declared dead
            if alive == record.is_up() && (alive || record.is_dead(threshold)) {
                continue;
            }

            if !alive {
                record.mark_down();
                self.store.save_worker(&record).await?;
                tracing::warn!(host = %host, down_pings = record.down_pings, "Worker ping failed");

                if record.is_dead(threshold) {
                    tracing::warn!(host = %host, "Worker declared dead");
                    report.declared_dead.push(host.to_string());
                    if record.queue_size > 0 {
                        report.reassigned += self.queue.reassign_work_from_dead_node(host).await?;
                    }
                }
                continue;
            }

            let was_dead = record.is_dead(threshold);
            let was_maybe_down = record.down_pings > 0 && !was_dead;
            record.mark_up();
            self.store.save_worker(&record).await?;
            report.came_up.push(host.to_string());

            if was_dead {
                tracing::info!(host = %host, "Dead worker is back, checking its queue");
                report.reassigned += self.integrity.check_worker(host).await?;
                new_worker_up = true;
            } else if was_maybe_down {
                tracing::info!(host = %host, "Worker recovered before being declared dead");
            } else {
                tracing::info!(host = %host, "New worker is up");
                new_worker_up = true;
            }
        }

        if new_worker_up {
            self.queue.reset_queue().await?;
            report.queue_reset = true;
        }
        Ok(report)
    }
}
