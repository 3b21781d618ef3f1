//! HTTP surface of the supervisor.
//!
//! Routes are thin: they parse the request, call into [`Supervisor`] and
//! serialize the result. Job events are streamed to browsers as
//! server-sent events on `/api/events`.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::SupervisorError;
use crate::scheduler::{Job, JobFilter, JobId, JobStatus};
use crate::supervisor::Supervisor;
use crate::worker::LogWindow;

#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Supervisor,
    /// Ends open event streams when the server shuts down
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub script_name: Option<String>,
    pub script_args: Option<Value>,
    #[serde(default)]
    pub user_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub script_name: Option<String>,
    pub user_id: Option<u64>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub items: Vec<Job>,
    pub count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    #[serde(alias = "maxSize")]
    pub max_size: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// [`SupervisorError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SupervisorError::JobNotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::JobRunning(_) | SupervisorError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            SupervisorError::InvalidScriptName(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/events", get(events_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route(
            "/api/jobs/{job_id}",
            get(get_job_handler).delete(delete_job_handler),
        )
        .route("/api/jobs/{job_id}/stop", post(stop_job_handler))
        .route("/api/jobs/{job_id}/kill", post(kill_job_handler))
        .route("/api/jobs/{job_id}/restart", post(restart_job_handler))
        .route("/api/jobs/{job_id}/log", get(job_log_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the state's shutdown token is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> ApiResult<Response> {
    let Some(script_name) = payload.script_name.as_deref() else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "script_name is required".to_string(),
            }),
        )
            .into_response());
    };

    let job_id = state
        .supervisor
        .submit_script(script_name, payload.script_args.as_ref(), payload.user_id)
        .await?;

    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })).into_response())
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let filter = JobFilter {
        script_name: query.script_name,
        user_id: query.user_id,
    };
    let items = state
        .supervisor
        .list_jobs(&filter, query.skip.unwrap_or(0), query.limit)
        .await?;
    let count = state.supervisor.count_jobs(&filter).await?;

    Ok(Json(JobListResponse { items, count }))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<Json<Job>> {
    let job = state
        .supervisor
        .get_job(job_id)
        .await?
        .ok_or(SupervisorError::JobNotFound(job_id))?;
    Ok(Json(job))
}

async fn delete_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<StatusCode> {
    state.supervisor.delete_job(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<StatusCode> {
    Ok(accepted(state.supervisor.stop(job_id).await?))
}

async fn kill_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<StatusCode> {
    Ok(accepted(state.supervisor.kill(job_id).await?))
}

fn accepted(signalled: bool) -> StatusCode {
    if signalled {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::BAD_REQUEST
    }
}

async fn restart_job_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
) -> ApiResult<StatusCode> {
    let job = state
        .supervisor
        .get_job(job_id)
        .await?
        .ok_or(SupervisorError::JobNotFound(job_id))?;
    if job.status == JobStatus::Running {
        return Err(SupervisorError::JobRunning(job_id).into());
    }

    state.supervisor.restart(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn job_log_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<JobId>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<LogWindow>> {
    let window = state
        .supervisor
        .tail_log(job_id, query.max_size, query.offset)
        .await?;
    Ok(Json(window))
}

async fn events_handler(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut events = state.supervisor.events().subscribe();
    let shutdown = state.shutdown.clone();
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        let sse = Event::default()
                            .event(event.name())
                            .data(event.payload().to_string());
                        if tx.send(Ok(sse)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream subscriber lagging");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}
