use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::EncoderConfig;
use crate::error::{CompressorError, Result};

/// Encode progress as reported by the codec tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub percent: u8,
    pub speed: f32,
}

/// Re-encodes one staged file into a result file.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Runs for the whole encode. Progress is sent on `progress` until the sender is dropped.
    async fn transcode(
        &self,
        job_id: Uuid,
        input: &Path,
        output: &Path,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> Result<()>;
}

/// Runs ffmpeg with a fixed parameter set, reading machine-readable progress from stdout.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    config: EncoderConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    fn encode_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let c = &self.config;
        vec![
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-f".to_string(),
            c.format.clone(),
            "-c:v".to_string(),
            c.video_codec.clone(),
            "-r".to_string(),
            c.framerate.to_string(),
            "-crf".to_string(),
            c.crf.to_string(),
            "-c:a".to_string(),
            c.audio_codec.clone(),
            "-b:a".to_string(),
            c.audio_bitrate.to_string(),
            "-ar".to_string(),
            c.audio_samplerate.to_string(),
            "-ac".to_string(),
            c.audio_channels.to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
            output.display().to_string(),
        ]
    }

    /// Duration of the input in microseconds, if ffprobe can tell.
    async fn probe_duration_us(&self, input: &Path) -> Option<u64> {
        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        let secs: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        Some((secs * 1_000_000.0) as u64)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        job_id: Uuid,
        input: &Path,
        output: &Path,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> Result<()> {
        let duration_us = self.probe_duration_us(input).await;
        tracing::info!(
            job_id = %job_id,
            codec = %self.config.video_codec,
            duration_us = ?duration_us,
            "Starting encode"
        );

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(self.encode_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // drain stderr concurrently so the child never blocks on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = ProgressParser::new(duration_us);
            while let Some(line) = lines.next_line().await? {
                if let Some(p) = parser.feed(&line) {
                    // receiver gone only means nobody is watching
                    let _ = progress.send(p);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            tracing::info!(job_id = %job_id, "Encode finished");
            Ok(())
        } else {
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            tracing::error!(job_id = %job_id, exit_code = ?status.code(), "Encode failed");
            Err(CompressorError::Transcode(format!(
                "exit code {:?}: {}",
                status.code(),
                tail
            )))
        }
    }
}

/// Folds ffmpeg `-progress` key=value lines into [`Progress`] updates.
///
/// ffmpeg emits a block of keys per update terminated by a `progress=` line;
/// one update is produced per block.
#[derive(Debug)]
pub struct ProgressParser {
    duration_us: Option<u64>,
    out_time_us: u64,
    speed: f32,
}

impl ProgressParser {
    pub fn new(duration_us: Option<u64>) -> Self {
        Self {
            duration_us,
            out_time_us: 0,
            speed: 0.0,
        }
    }

    pub fn feed(&mut self, line: &str) -> Option<Progress> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // out_time_ms is also in microseconds despite the name
            "out_time_us" | "out_time_ms" => {
                if let Ok(v) = value.trim().parse::<u64>() {
                    self.out_time_us = v;
                }
                None
            }
            "speed" => {
                if let Ok(v) = value.trim().trim_end_matches('x').parse::<f32>() {
                    self.speed = v;
                }
                None
            }
            "progress" => {
                let percent = if value.trim() == "end" {
                    100
                } else {
                    self.percent()
                };
                Some(Progress {
                    percent,
                    speed: self.speed,
                })
            }
            _ => None,
        }
    }

    fn percent(&self) -> u8 {
        match self.duration_us {
            Some(d) if d > 0 => ((self.out_time_us.saturating_mul(100) / d).min(99)) as u8,
            _ => 0,
        }
    }
}
