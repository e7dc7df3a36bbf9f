//! HTTP transport for the coordinator.

use crate::coordinator::Coordinator;
use crate::export::ExportRow;
use crate::protocol::{HealthResponse, HeartbeatRequest, LeaseRequest, SubmitRequest};
use crate::shutdown::Shutdown;
use crate::CrawlError;
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Body of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    pub status_code: StatusCode,
    /// Stable, machine-readable code in SCREAMING_SNAKE_CASE
    pub error_code: String,
    pub error_message: String,
}

impl ErrorResponse {
    fn bad_request(error_code: &str, error_message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::BAD_REQUEST,
            error_code: error_code.to_string(),
            error_message: error_message.into(),
        }
    }
}

impl From<JsonRejection> for ErrorResponse {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status_code: StatusCode::BAD_REQUEST,
            error_code: "INVALID_REQUEST_BODY".to_string(),
            error_message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status_code, Json(self)).into_response()
    }
}

fn require_worker_id(worker_id: &str) -> Result<(), ErrorResponse> {
    if worker_id.trim().is_empty() {
        return Err(ErrorResponse::bad_request("MISSING_WORKER_ID", "worker_id must not be empty"));
    }
    Ok(())
}

pub fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/lease", post(handle_lease))
        .route("/result", post(handle_result))
        .route("/heartbeat", post(handle_heartbeat))
        .route("/stats", get(handle_stats))
        .route("/export", get(handle_export))
        .route("/health", get(handle_health))
        .with_state(coordinator)
}

async fn handle_lease(
    State(coordinator): State<Coordinator>,
    body: Result<Json<LeaseRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let Json(request) = body?;
    require_worker_id(&request.worker_id)?;
    Ok(Json(coordinator.request_lease(&request.worker_id).await))
}

async fn handle_result(
    State(coordinator): State<Coordinator>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let Json(request) = body?;
    require_worker_id(&request.worker_id)?;
    if request.job_id.is_empty() {
        return Err(ErrorResponse::bad_request("MISSING_JOB_ID", "job_id must not be empty"));
    }
    Ok(Json(coordinator.submit_result(request).await))
}

async fn handle_heartbeat(
    State(coordinator): State<Coordinator>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let Json(request) = body?;
    require_worker_id(&request.worker_id)?;
    Ok(Json(coordinator.heartbeat(&request.job_id, &request.worker_id).await))
}

async fn handle_stats(State(coordinator): State<Coordinator>) -> impl IntoResponse {
    Json(coordinator.get_stats())
}

async fn handle_export(State(coordinator): State<Coordinator>) -> Response {
    let entities = coordinator.export().await;
    let rows: Vec<ExportRow<'_>> = entities.iter().map(ExportRow::from).collect();
    Json(rows).into_response()
}

async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse::ok())
}

/// Serve the coordinator API on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, coordinator: Coordinator, shutdown: Arc<Shutdown>) -> Result<(), CrawlError> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "coordinator listening");
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    tracing::info!("http server stopped");
    Ok(())
}
