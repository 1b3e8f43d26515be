// Route definitions for the evaluation API

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, metrics, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(handlers::service_info))
        .route("/evaluate", post(handlers::submit_evaluation))
        .route("/status/:job_id", get(handlers::get_status))
        .route("/job/:job_id", delete(handlers::delete_job))
        .route("/jobs", get(handlers::list_jobs))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route_layer(middleware::from_fn(metrics::track_requests))
}
