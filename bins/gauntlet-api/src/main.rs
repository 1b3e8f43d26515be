mod error;
mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use gauntlet_common::{Config, JobRegistry};
use gauntlet_worker::{DatasetCache, ExecutionQueue, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub queue: ExecutionQueue,
    pub dataset: Arc<DatasetCache>,
    pub start_time: Arc<std::time::Instant>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();
    info!("Evaluation API booting...");

    let config = Config::from_env().context("invalid configuration")?;
    info!(store = ?config.store, dataset = %config.dataset.key, "Configuration loaded");

    metrics::init_metrics().context("failed to register metrics")?;
    info!("Metrics registry initialized");

    let pipeline = Arc::new(Pipeline::from_config(&config).context("failed to open object store")?);
    let dataset = pipeline.dataset().clone();
    let registry = Arc::new(JobRegistry::new());
    let (queue, worker) = ExecutionQueue::start(registry.clone(), pipeline, config.queue_capacity);
    info!(capacity = config.queue_capacity, "Execution worker started");

    // Start background metrics subscriber
    tokio::spawn(metrics::completion_subscriber(queue.subscribe()));

    if let Some(retention) = config.job_retention {
        tokio::spawn(retention_sweep(registry.clone(), retention));
    }

    if config.dataset.warm_on_startup {
        let dataset = dataset.clone();
        tokio::spawn(async move {
            if let Err(e) = dataset.ensure_ready().await {
                tracing::warn!(error = %e, "Dataset warm-up failed; will retry on first job");
            }
        });
    }

    let state = Arc::new(AppState {
        registry,
        queue,
        dataset,
        start_time: Arc::new(std::time::Instant::now()),
    });

    // Build router
    let app = Router::new()
        .merge(routes::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!("HTTP server listening on {}", config.bind_addr);
    info!("Ready to accept evaluation jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    worker.abort();
    info!("Evaluation API stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Periodically drop terminal jobs older than `retention`.
async fn retention_sweep(registry: Arc<JobRegistry>, retention: Duration) {
    let max_age = match chrono::Duration::from_std(retention) {
        Ok(age) => age,
        Err(e) => {
            tracing::error!(error = %e, "Job retention out of range; sweep disabled");
            return;
        }
    };
    let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(300));
    info!(retention_secs = retention.as_secs(), "Job retention sweep enabled");

    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let purged = registry.purge_terminal_older_than(max_age).await;
        if purged > 0 {
            info!(purged, "Expired finished jobs");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
