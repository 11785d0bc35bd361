use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CompressorError, Result};

/// HTTP listener and the URL this node is reachable at.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Public base URL, used for download links and as the return URL handed to workers.
    pub host_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            host_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

/// Directories holding staged uploads, finished results, and files queued for recovery.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub queue_dir: PathBuf,
    pub results_dir: PathBuf,
    pub recovery_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            queue_dir: PathBuf::from("/opt/media-compressor/queue"),
            results_dir: PathBuf::from("/opt/media-compressor/results"),
            recovery_dir: PathBuf::from("/opt/media-compressor/recovery"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue depth limit for admission (waiting + locally executing jobs).
    pub max_queue_size: usize,
    /// Encode slots on this node.
    pub max_concurrent_local_jobs: usize,
    /// Finalization callbacks (status update, notification decision) running at once.
    pub finalizer_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 5,
            max_concurrent_local_jobs: 1,
            finalizer_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Below this much free queue space (MB) the node reports itself as disk-full to masters.
    pub free_space_threshold_mb: i64,
    /// Panic level: uploads are refused when they would leave less than this (MB).
    pub minimum_space_remaining_mb: i64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            free_space_threshold_mb: 1500,
            minimum_space_remaining_mb: 300,
        }
    }
}

/// A remote worker this node may dispatch to.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub host: String,
    /// Higher means a more capable worker; its reported queue depth is divided by this.
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
}

fn default_efficiency() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub workers: Vec<WorkerConfig>,
    /// Shared secret presented to workers. Without it this node never dispatches remotely.
    pub master_key: Option<String>,
    /// Whether this node accepts work pushed by masters.
    pub worker_mode_enabled: bool,
    /// Master keys accepted by the worker endpoints. A single `*` disables the check.
    pub allowed_master_keys: Vec<String>,
    /// Consecutive failed pings before a worker is declared dead.
    pub down_pings_threshold: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            master_key: None,
            worker_mode_enabled: true,
            allowed_master_keys: Vec::new(),
            down_pings_threshold: 3,
        }
    }
}

impl ClusterConfig {
    /// Returns true if `key` may use the worker endpoints.
    pub fn is_master_allowed(&self, key: &str) -> bool {
        if self.allowed_master_keys.len() == 1 && self.allowed_master_keys[0] == "*" {
            return true;
        }
        self.allowed_master_keys.iter().any(|k| k == key)
    }
}

/// Timeouts and retry policy for calls to other nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ping_timeout_secs: u64,
    pub status_timeout_secs: u64,
    pub integrity_timeout_secs: u64,
    pub send_work_timeout_secs: u64,
    pub send_work_retries: u32,
    pub send_work_min_backoff_secs: u64,
    pub submit_result_timeout_secs: u64,
    pub submit_result_retries: u32,
    pub submit_result_min_backoff_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ping_timeout_secs: 5,
            status_timeout_secs: 5,
            integrity_timeout_secs: 10,
            send_work_timeout_secs: 1200,
            send_work_retries: 3,
            send_work_min_backoff_secs: 5,
            submit_result_timeout_secs: 1800,
            submit_result_retries: 5,
            submit_result_min_backoff_secs: 10,
        }
    }
}

/// Age (minutes) and free-space (MB) thresholds for the reclamation sweeps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub claimed_time_mins: i64,
    pub claimed_space_mb: i64,
    pub unclaimed_time_mins: i64,
    pub unclaimed_space_mb: i64,
    pub error_time_mins: i64,
    pub error_space_mb: i64,
    pub transitive_time_mins: i64,
    pub stale_time_mins: i64,
    pub in_queue_time_mins: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            claimed_time_mins: 15,
            claimed_space_mb: 2000,
            unclaimed_time_mins: 90,
            unclaimed_space_mb: 4000,
            error_time_mins: 45,
            error_space_mb: 6000,
            transitive_time_mins: 15,
            stale_time_mins: 720,
            in_queue_time_mins: 1440,
        }
    }
}

/// How often each periodic task runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub health_check_secs: u64,
    pub integrity_check_secs: u64,
    pub claimed_sweep_secs: u64,
    pub unclaimed_sweep_secs: u64,
    pub error_sweep_secs: u64,
    pub transitive_sweep_secs: u64,
    pub stale_sweep_secs: u64,
    pub recovery_sweep_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            health_check_secs: 60,
            integrity_check_secs: 18 * 60,
            claimed_sweep_secs: 16 * 60,
            unclaimed_sweep_secs: 9 * 60,
            error_sweep_secs: 15 * 60,
            transitive_sweep_secs: 13 * 60,
            stale_sweep_secs: 60 * 60,
            recovery_sweep_secs: 19 * 60,
        }
    }
}

/// Fixed parameter set for the external codec tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub format: String,
    pub video_codec: String,
    pub framerate: f64,
    pub crf: f64,
    pub audio_codec: String,
    pub audio_bitrate: u64,
    pub audio_samplerate: u32,
    pub audio_channels: u32,
    /// Extension given to downloaded results.
    pub extension: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("/usr/bin/ffmpeg"),
            ffprobe_path: PathBuf::from("/usr/bin/ffprobe"),
            format: "mp4".to_string(),
            video_codec: "libx265".to_string(),
            framerate: 24.0,
            crf: 28.0,
            audio_codec: "aac".to_string(),
            audio_bitrate: 32768,
            audio_samplerate: 44100,
            audio_channels: 1,
            extension: "mp4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// How long a queue-full answer is reused before asking the cluster again.
    pub queue_full_cache_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            queue_full_cache_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub queue: QueueConfig,
    pub space: SpaceConfig,
    pub cluster: ClusterConfig,
    pub network: NetworkConfig,
    pub cleanup: CleanupConfig,
    pub schedule: ScheduleConfig,
    pub encoder: EncoderConfig,
    pub api: ApiConfig,
}

impl NodeConfig {
    /// Parse a TOML document. Missing sections and keys fall back to defaults.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| CompressorError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CompressorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn with_worker(mut self, host: impl Into<String>, efficiency: f64) -> Self {
        self.cluster.workers.push(WorkerConfig {
            host: host.into(),
            efficiency,
        });
        self
    }

    pub fn with_master_key(mut self, key: impl Into<String>) -> Self {
        self.cluster.master_key = Some(key.into());
        self
    }

    /// Configured efficiency factor for a worker, 1.0 for unknown hosts.
    pub fn efficiency_of(&self, host: &str) -> f64 {
        self.cluster
            .workers
            .iter()
            .find(|w| w.host == host)
            .map(|w| w.efficiency)
            .unwrap_or(1.0)
    }

    /// Where workers should post results for jobs dispatched by this node.
    pub fn return_url(&self) -> String {
        format!("{}/worker/accept", self.server.host_url.trim_end_matches('/'))
    }
}

impl NetworkConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn integrity_timeout(&self) -> Duration {
        Duration::from_secs(self.integrity_timeout_secs)
    }
}
