//! HTTP API for the transcode service
//!
//! Thin JSON layer over [`TranscodeService`]; every handler maps one facade
//! operation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::jobs::{JobStatusReport, ReportedStatus};
use crate::service::{
    BatchResult, ProviderStatus, ServiceError, TranscodeRequest, TranscodeService,
};

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

type SharedService = Arc<TranscodeService>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: ReportedStatus,
    pub input_path: String,
    pub output_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub jobs: Vec<TranscodeRequest>,
    #[serde(default)]
    pub default_preset: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Facade error rendered as a JSON response
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::FileNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::WorkerUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// POST /jobs
async fn submit_job(
    State(service): State<SharedService>,
    Json(request): Json<TranscodeRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let input_path = request.input_path.clone();
    let output_path = request.output_path.clone();
    let job_id = service.transcode(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: ReportedStatus::Queued,
            input_path,
            output_path,
        }),
    ))
}

/// POST /jobs/batch
async fn submit_batch(
    State(service): State<SharedService>,
    Json(request): Json<BatchRequest>,
) -> Json<Vec<BatchResult>> {
    Json(
        service
            .batch_transcode(request.jobs, request.default_preset)
            .await,
    )
}

/// GET /jobs
async fn list_jobs(State(service): State<SharedService>) -> Json<Vec<JobStatusReport>> {
    Json(service.list_jobs().await)
}

/// GET /jobs/:id
async fn get_job(
    State(service): State<SharedService>,
    Path(job_id): Path<String>,
) -> (StatusCode, Json<JobStatusReport>) {
    let report = service.get_job_status(&job_id).await;
    let status = if report.status == ReportedStatus::NotFound {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

/// POST /jobs/:id/cancel
async fn cancel_job(
    State(service): State<SharedService>,
    Path(job_id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = service.cancel_job(&job_id).await;
    Json(CancelResponse { job_id, cancelled })
}

/// GET /presets
async fn get_presets(State(service): State<SharedService>) -> Json<Vec<String>> {
    Json(service.get_presets().await)
}

/// GET /status
async fn get_status(State(service): State<SharedService>) -> Json<ProviderStatus> {
    Json(service.get_provider_status().await)
}

/// Creates the axum Router with all job endpoints
pub fn create_router(service: SharedService) -> Router {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/batch", post(submit_batch))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/presets", get(get_presets))
        .route("/status", get(get_status))
        .with_state(service)
}

/// Runs the API server on `bind` until the task is aborted
pub async fn run_api_server(service: SharedService, bind: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_router(service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
