use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{RequestBuilder, StatusCode};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::error::{CompressorError, Result};
use crate::remote::{
    OutboundWork, QueueStatus, RemoteNodeClient, FILE_NAME_HEADER, JOB_ID_HEADER,
    MASTER_KEY_HEADER, RETURN_URL_HEADER,
};

/// Talks to other nodes over their worker endpoints.
#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    client: reqwest::Client,
    master_key: Option<String>,
    network: NetworkConfig,
}

impl HttpNodeClient {
    pub fn new(master_key: Option<String>, network: NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            master_key,
            network,
        })
    }

    fn url(host: &str, path: &str) -> String {
        format!("{}{}", host.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.master_key {
            Some(key) => request.header(MASTER_KEY_HEADER, key),
            None => request,
        }
    }

    async fn try_send_work(&self, host: &str, work: &OutboundWork) -> Result<()> {
        let file = tokio::fs::File::open(&work.payload).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .authorized(self.client.post(Self::url(host, "/worker/")))
            .header(FILE_NAME_HEADER, &work.file_name)
            .header(JOB_ID_HEADER, work.job_id.to_string())
            .header(RETURN_URL_HEADER, &work.return_url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .timeout(Duration::from_secs(self.network.send_work_timeout_secs))
            .body(body)
            .send()
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CompressorError::Remote {
                host: host.to_string(),
                message: format!("work not accepted ({}): {}", status, text),
            });
        }
        Ok(())
    }

    async fn try_send_result(&self, origin_id: Uuid, payload: &Path, return_url: &str) -> Result<()> {
        let file = tokio::fs::File::open(payload).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .authorized(self.client.post(return_url))
            .header(JOB_ID_HEADER, origin_id.to_string())
            .timeout(Duration::from_secs(self.network.submit_result_timeout_secs))
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CompressorError::Remote {
                host: return_url.to_string(),
                message: format!("result refused ({}): {}", status, text),
            });
        }
        Ok(())
    }
}

/// Runs `op` until it succeeds, a non-transport error occurs, or `retries` extra attempts are spent.
async fn with_retries<F, Fut>(
    what: &str,
    peer: &str,
    retries: u32,
    min_backoff: Duration,
    mut op: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries && is_transient(&e) => {
                let delay = backoff(min_backoff, attempt);
                tracing::warn!(
                    peer = %peer,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    what
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(err: &CompressorError) -> bool {
    match err {
        CompressorError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        // an explicit refusal from the other side is final
        _ => false,
    }
}

/// Exponential backoff with up to 25% random jitter.
fn backoff(min: Duration, attempt: u32) -> Duration {
    let base = min.saturating_mul(1u32 << attempt.min(10));
    let max_jitter = (base.as_millis() / 4) as u64;
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    base + Duration::from_millis(jitter)
}

#[async_trait]
impl RemoteNodeClient for HttpNodeClient {
    async fn ping(&self, host: &str) -> bool {
        let result = self
            .authorized(self.client.get(Self::url(host, "/worker/ping")))
            .timeout(self.network.ping_timeout())
            .send()
            .await;
        match result {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "Ping failed");
                false
            }
        }
    }

    async fn queue_status(&self, host: &str) -> Result<QueueStatus> {
        let response = self
            .authorized(self.client.get(Self::url(host, "/worker/queue/size")))
            .timeout(self.network.status_timeout())
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(CompressorError::Remote {
                host: host.to_string(),
                message: format!("queue status returned {}", response.status()),
            });
        }
        Ok(response.json::<QueueStatus>().await?)
    }

    async fn is_job_in_queue(&self, host: &str, job_id: Uuid) -> Result<bool> {
        let response = self
            .authorized(self.client.get(Self::url(host, "/worker/queue/exists")))
            .query(&[("jobId", job_id.to_string())])
            .timeout(self.network.integrity_timeout())
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(CompressorError::Remote {
                host: host.to_string(),
                message: format!("queue lookup returned {}", other),
            }),
        }
    }

    async fn send_work(&self, host: &str, work: &OutboundWork) -> Result<()> {
        with_retries(
            "Sending work",
            host,
            self.network.send_work_retries,
            Duration::from_secs(self.network.send_work_min_backoff_secs),
            || self.try_send_work(host, work),
        )
        .await
    }

    async fn send_result(
        &self,
        origin_id: Uuid,
        payload: PathBuf,
        return_url: &str,
    ) -> Result<()> {
        with_retries(
            "Sending result",
            return_url,
            self.network.submit_result_retries,
            Duration::from_secs(self.network.submit_result_min_backoff_secs),
            || self.try_send_result(origin_id, &payload, return_url),
        )
        .await
    }
}
