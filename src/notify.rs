use async_trait::async_trait;

use crate::error::Result;
use crate::scheduler::Job;

/// Tells job owners about finished or failed work.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// One message covering every job in `jobs`.
    async fn jobs_ready(&self, email: &str, jobs: &[Job]) -> Result<()>;

    async fn job_failed(&self, email: &str, job: &Job) -> Result<()>;
}

/// Writes notifications to the log, with download links built from the public URL.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    host_url: String,
}

impl LogNotifier {
    pub fn new(host_url: impl Into<String>) -> Self {
        Self {
            host_url: host_url.into(),
        }
    }

    fn download_link(&self, job: &Job) -> String {
        format!("{}/jobs/{}/download", self.host_url.trim_end_matches('/'), job.id)
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn jobs_ready(&self, email: &str, jobs: &[Job]) -> Result<()> {
        let links: Vec<String> = jobs
            .iter()
            .map(|j| format!("{} -> {}", j.name, self.download_link(j)))
            .collect();
        tracing::info!(email, count = jobs.len(), links = ?links, "Jobs ready for download");
        Ok(())
    }

    async fn job_failed(&self, email: &str, job: &Job) -> Result<()> {
        tracing::info!(email, job_id = %job.id, name = %job.name, "Job failed, owner notified");
        Ok(())
    }
}
