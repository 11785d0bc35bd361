//! HTTP surface: the public job API and the worker protocol spoken between nodes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::{CompressorError, Result};
use crate::remote::{FILE_NAME_HEADER, JOB_ID_HEADER, MASTER_KEY_HEADER, RETURN_URL_HEADER};
use crate::scheduler::{Accepted, Job, JobStatus};
use crate::service::JobService;

pub const USER_EMAIL_HEADER: &str = "User-Email";

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<JobService>,
    /// Last "queue is full" answer and when it was computed.
    queue_full_since: Arc<Mutex<Option<Instant>>>,
}

impl ApiState {
    pub fn new(service: Arc<JobService>) -> Self {
        Self {
            service,
            queue_full_since: Arc::new(Mutex::new(None)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub speed: f32,
    pub original_size: u64,
    pub compressed_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            name: job.name,
            status: job.status,
            progress: job.progress,
            speed: job.speed,
            original_size: job.original_size,
            compressed_size: job.compressed_size,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    /// `local`, a worker host, or `waiting`.
    pub placement: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueFullResponse {
    pub queue_full: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for CompressorError {
    fn into_response(self) -> Response {
        let status = match &self {
            CompressorError::NotEnoughSpace | CompressorError::QueueFull => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CompressorError::JobNotFound(_) => StatusCode::NOT_FOUND,
            CompressorError::InvalidStatus { .. } | CompressorError::IllegalTransition { .. } => {
                StatusCode::CONFLICT
            }
            CompressorError::MasterNotAuthorized => StatusCode::UNAUTHORIZED,
            CompressorError::WorkerModeNotAllowed => StatusCode::FORBIDDEN,
            CompressorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/status", get(owner_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/download", get(download_job))
        .route("/queue/status", get(queue_status))
        .route("/worker/ping", get(worker_ping))
        .route("/worker/queue/size", get(worker_queue_size))
        .route("/worker/queue/exists", get(worker_queue_exists))
        .route("/worker/", post(worker_accept_work))
        .route("/worker/accept", post(worker_accept_result))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves the API until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
        CompressorError::Io(e)
    })?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("API server stopped");
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    header_str(headers, name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CompressorError::BadRequest(format!("missing header {}", name)))
}

fn content_length(headers: &HeaderMap) -> u64 {
    header_str(headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn parse_job_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|_| CompressorError::BadRequest(format!("invalid job id {}", value)))
}

/// Adapts a request body into an `AsyncRead`.
fn body_reader(body: Body) -> impl tokio::io::AsyncRead + Unpin + Send {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
    StreamReader::new(stream)
}

fn placement(accepted: &Accepted) -> String {
    match accepted {
        Accepted::Dispatched(node) => node.to_string(),
        Accepted::Waiting => "waiting".to_string(),
    }
}

fn ensure_master_authorized(state: &ApiState, headers: &HeaderMap, endpoint: &str) -> Result<()> {
    let cluster = &state.service.config().cluster;
    if !cluster.worker_mode_enabled {
        tracing::warn!(endpoint, "Worker endpoint used while worker mode is disabled");
        return Err(CompressorError::WorkerModeNotAllowed);
    }
    let key = header_str(headers, MASTER_KEY_HEADER).unwrap_or("");
    if !cluster.is_master_allowed(key) {
        tracing::warn!(endpoint, "Worker endpoint used with an unknown master key");
        return Err(CompressorError::MasterNotAuthorized);
    }
    Ok(())
}

async fn submit_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse> {
    let email = required_header(&headers, USER_EMAIL_HEADER)?.to_string();
    let name = required_header(&headers, FILE_NAME_HEADER)?.to_string();
    let size = content_length(&headers);

    let mut reader = body_reader(body);
    let (id, accepted) = state
        .service
        .submit_upload(&name, &email, size, &mut reader)
        .await??;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id,
            placement: placement(&accepted),
        }),
    ))
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Result<Json<JobView>> {
    Ok(Json(state.service.get_job(id).await?.into()))
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    user: String,
}

async fn owner_jobs(
    State(state): State<ApiState>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Vec<JobView>>> {
    let jobs = state.service.jobs_for_owner(&query.user).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

async fn download_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Result<Response> {
    let job = state.service.get_job(id).await?;
    let path = state.service.download(id).await?;
    let file = tokio::fs::File::open(&path).await?;

    let extension = &state.service.config().encoder.extension;
    let disposition = format!("attachment; filename=\"{}.{}\"", job.name, extension);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct QueueStatusQuery {
    #[serde(default)]
    size: u64,
}

async fn queue_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<QueueStatusQuery>,
) -> Json<QueueFullResponse> {
    let own_key = state.service.config().cluster.master_key.as_deref();
    if own_key.is_some() && header_str(&headers, MASTER_KEY_HEADER) == own_key {
        return Json(QueueFullResponse { queue_full: false });
    }

    let cache_for = Duration::from_secs(state.service.config().api.queue_full_cache_secs);
    let mut cached = state.queue_full_since.lock().await;
    if let Some(since) = *cached {
        if since.elapsed() < cache_for {
            return Json(QueueFullResponse { queue_full: true });
        }
    }

    let full = state.service.is_queue_full(query.size).await;
    *cached = if full { Some(Instant::now()) } else { None };
    Json(QueueFullResponse { queue_full: full })
}

async fn worker_ping(State(state): State<ApiState>, headers: HeaderMap) -> Result<&'static str> {
    ensure_master_authorized(&state, &headers, "/worker/ping")?;
    Ok("pong")
}

async fn worker_queue_size(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<crate::remote::QueueStatus>> {
    ensure_master_authorized(&state, &headers, "/worker/queue/size")?;
    Ok(Json(state.service.worker_queue_status().await?))
}

#[derive(Debug, Deserialize)]
struct ExistsQuery {
    #[serde(rename = "jobId")]
    job_id: Uuid,
}

async fn worker_queue_exists(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ExistsQuery>,
) -> Result<StatusCode> {
    ensure_master_authorized(&state, &headers, "/worker/queue/exists")?;
    if state.service.is_remote_job_in_queue(query.job_id).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn worker_accept_work(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode> {
    ensure_master_authorized(&state, &headers, "/worker/")?;
    let name = required_header(&headers, FILE_NAME_HEADER)?.to_string();
    let origin_id = parse_job_id(required_header(&headers, JOB_ID_HEADER)?)?;
    let return_url = required_header(&headers, RETURN_URL_HEADER)?.to_string();
    let size = content_length(&headers);

    let mut reader = body_reader(body);
    state
        .service
        .accept_remote_work(origin_id, &name, size, &return_url, &mut reader)
        .await??;
    Ok(StatusCode::ACCEPTED)
}

async fn worker_accept_result(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode> {
    let job_id = parse_job_id(required_header(&headers, JOB_ID_HEADER)?)?;
    let mut reader = body_reader(body);
    state
        .service
        .accept_remote_result(job_id, &mut reader)
        .await?;
    Ok(StatusCode::OK)
}
