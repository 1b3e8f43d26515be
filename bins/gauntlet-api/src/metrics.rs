// Prometheus metrics for the evaluation API

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use gauntlet_common::{CompletionEvent, JobStatus};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;

lazy_static! {
    // Global registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_SUBMITTED: IntCounter = IntCounter::new(
        "gauntlet_jobs_submitted_total",
        "Total number of evaluation jobs accepted"
    )
    .expect("metric can be created");

    // Rejections at intake (queue_full, invalid_request)
    pub static ref JOBS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("gauntlet_jobs_rejected_total", "Total jobs rejected at submission"),
        &["reason"]
    )
    .expect("metric can be created");

    pub static ref JOBS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("gauntlet_jobs_completed_total", "Total jobs that reached a terminal state"),
        &["status"]
    )
    .expect("metric can be created");

    pub static ref JOB_FAILURES: CounterVec = CounterVec::new(
        Opts::new("gauntlet_job_failures_total", "Failed jobs by error kind"),
        &["kind"]
    )
    .expect("metric can be created");

    // Wall time of successful evaluations, in seconds
    pub static ref EVALUATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("gauntlet_evaluation_seconds", "Evaluation wall time in seconds")
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0]),
    )
    .expect("metric can be created");

    pub static ref ACTIVE_JOBS: IntGauge = IntGauge::new(
        "gauntlet_active_jobs",
        "Jobs currently queued or processing"
    )
    .expect("metric can be created");

    pub static ref API_REQUESTS: CounterVec = CounterVec::new(
        Opts::new("gauntlet_api_requests_total", "Total API requests"),
        &["endpoint", "status"]
    )
    .expect("metric can be created");
}

/// Register every collector with the global registry.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(JOBS_SUBMITTED.clone()))?;
    REGISTRY.register(Box::new(JOBS_REJECTED.clone()))?;
    REGISTRY.register(Box::new(JOBS_COMPLETED.clone()))?;
    REGISTRY.register(Box::new(JOB_FAILURES.clone()))?;
    REGISTRY.register(Box::new(EVALUATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_JOBS.clone()))?;
    REGISTRY.register(Box::new(API_REQUESTS.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn record_job_submitted() {
    JOBS_SUBMITTED.inc();
}

pub fn record_job_rejected(reason: &str) {
    JOBS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_job_completed(event: &CompletionEvent) {
    JOBS_COMPLETED
        .with_label_values(&[&event.status.to_string()])
        .inc();
    match (event.status, event.error_kind) {
        (JobStatus::Completed, _) => {
            if let Some(secs) = event.eval_time_secs {
                EVALUATION_SECONDS.observe(secs);
            }
        }
        (JobStatus::Failed, Some(kind)) => {
            JOB_FAILURES.with_label_values(&[&kind.to_string()]).inc();
        }
        _ => {}
    }
}

pub fn set_active_jobs(count: usize) {
    ACTIVE_JOBS.set(count as i64);
}

/// Background task turning queue completion events into metrics.
pub async fn completion_subscriber(mut events: broadcast::Receiver<CompletionEvent>) {
    tracing::info!("Metrics subscriber started - listening for job completions");

    loop {
        match events.recv().await {
            Ok(event) => {
                record_job_completed(&event);
                tracing::debug!(
                    job_id = %event.job_id,
                    status = %event.status,
                    "Recorded job completion metrics"
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Metrics subscriber lagged; some completions not counted");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Count every routed request by its route template and response status.
pub async fn track_requests(req: Request, next: Next) -> Response {
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;
    API_REQUESTS
        .with_label_values(&[&endpoint, response.status().as_str()])
        .inc();
    response
}
