use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Up,
    Down,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Up => write!(f, "UP"),
            WorkerStatus::Down => write!(f, "DOWN"),
        }
    }
}

/// Remote execution target, keyed by host. Created lazily, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub host: String,
    pub status: WorkerStatus,
    pub queue_size: usize,
    pub last_alive: Option<DateTime<Utc>>,
    pub down_pings: u32,
}

impl WorkerNode {
    /// New workers start DOWN until their first successful ping.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: WorkerStatus::Down,
            queue_size: 0,
            last_alive: None,
            down_pings: 0,
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == WorkerStatus::Up
    }

    pub fn is_dead(&self, threshold: u32) -> bool {
        self.down_pings >= threshold
    }

    pub fn mark_up(&mut self) {
        self.status = WorkerStatus::Up;
        self.down_pings = 0;
        self.last_alive = Some(Utc::now());
    }

    pub fn mark_down(&mut self) {
        self.status = WorkerStatus::Down;
        self.down_pings = self.down_pings.saturating_add(1);
    }
}
