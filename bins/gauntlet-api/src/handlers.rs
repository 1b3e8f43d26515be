// HTTP route handlers for the evaluation API

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use gauntlet_common::{EvaluationRequest, Job, JobStatus};
use gauntlet_worker::SubmitError;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub total: usize,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub status: &'static str,
    pub version: &'static str,
    pub active_jobs: usize,
    pub dataset: gauntlet_worker::DatasetState,
    pub uptime_secs: u64,
}

/// POST /evaluate - Queue an evaluation job
pub async fn submit_evaluation(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EvaluationRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    if payload.submission_reference.trim().is_empty() {
        metrics::record_job_rejected("invalid_request");
        return Err(ApiError::BadRequest(
            "submission_reference must not be empty".to_string(),
        ));
    }

    let job = state.queue.submit(payload).await.map_err(|e| {
        metrics::record_job_rejected(match e {
            SubmitError::QueueFull(_) => "queue_full",
            SubmitError::Closed => "worker_stopped",
        });
        ApiError::from(e)
    })?;
    metrics::record_job_submitted();

    Ok(Json(SubmitResponse {
        job_id: job.id,
        status: job.status,
        message: "Evaluation job submitted successfully".to_string(),
    }))
}

/// GET /status/:job_id - Full job snapshot
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Job>> {
    let not_found = || ApiError::NotFound(format!("Job {} not found", job_id));

    let id = Uuid::parse_str(&job_id).map_err(|_| not_found())?;
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(not_found)
}

/// DELETE /job/:job_id - Forget a job. Succeeds for unknown ids too.
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Json<serde_json::Value> {
    if let Ok(id) = Uuid::parse_str(&job_id) {
        if state.registry.delete(&id).await {
            tracing::info!(job_id = %id, "Job deleted");
        }
    }
    Json(serde_json::json!({ "status": "deleted" }))
}

/// GET /jobs - Every job the service still knows about
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<JobList> {
    let jobs = state.registry.list().await;
    Json(JobList {
        total: jobs.len(),
        jobs,
    })
}

/// GET / - Liveness with a summary of service state
pub async fn service_info(State(state): State<Arc<AppState>>) -> Json<ServiceInfo> {
    let active_jobs = state.registry.active_count().await;
    metrics::set_active_jobs(active_jobs);

    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        active_jobs,
        dataset: state.dataset.state(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    metrics::set_active_jobs(state.registry.active_count().await);

    let body = metrics::render_metrics().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
