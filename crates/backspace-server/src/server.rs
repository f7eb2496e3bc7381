//! Axum routes for job submission, status and cancellation

use crate::sse;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use backspace_core::config::ServerConfig;
use backspace_core::{BackspaceError, JobId, JobRequest};
use backspace_orchestrator::{JobService, JobStatus};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared application state
pub struct AppState {
    pub service: Arc<JobService>,
    /// Accept repositories on the server's own filesystem
    pub allow_local_sources: bool,
}

pub type SharedState = Arc<AppState>;

/// Error response carrying the status code derived from a [`BackspaceError`]
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }
}

impl From<BackspaceError> for ApiError {
    fn from(error: BackspaceError) -> Self {
        let status = match &error {
            BackspaceError::JobNotFound(_) => StatusCode::NOT_FOUND,
            BackspaceError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            BackspaceError::Other(_) | BackspaceError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub(crate) fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse().map_err(ApiError::bad_request)
}

/// All routes, ready to serve or to drive with `tower::ServiceExt::oneshot`
pub fn router(service: Arc<JobService>, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState {
        service,
        allow_local_sources: config.allow_local_sources,
    });

    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(job_status).delete(cancel_job))
        .route("/jobs/:id/events", get(sse::job_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `config.addr` until `shutdown` resolves
pub async fn serve<F>(
    service: Arc<JobService>,
    config: &ServerConfig,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    if config.allow_local_sources {
        warn!("Accepting local repository paths from HTTP clients");
    }
    axum::serve(listener, router(service, config))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "backspace"
    }))
}

/// POST /jobs
async fn submit_job(
    State(app): State<SharedState>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if !app.allow_local_sources && request.repository.is_host_local() {
        warn!("Rejected local repository {}", request.repository);
        return Err(ApiError::forbidden(format!(
            "repository {} is on the server's filesystem; only network URLs are accepted",
            request.repository
        )));
    }
    let job_id = app.service.submit(request).map_err(|e| {
        warn!("Rejected job: {}", e);
        ApiError::from(e)
    })?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

/// GET /jobs
async fn list_jobs(State(app): State<SharedState>) -> Json<Vec<JobStatus>> {
    Json(app.service.list())
}

/// GET /jobs/:id
async fn job_status(
    State(app): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(app.service.status(job_id)?))
}

/// DELETE /jobs/:id
async fn cancel_job(
    State(app): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let cancelled = app.service.cancel(job_id)?;
    Ok(Json(json!({ "job_id": job_id, "cancelled": cancelled })))
}
