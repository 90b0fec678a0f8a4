use cell_analysis_worker::{
    config::WorkerConfig,
    db::{self, PgJobStore},
    error::WorkerError,
    services::{
        broker, inference::InferenceEngine, storage::S3ObjectStore, yolo::OnnxDetector,
    },
    shutdown::shutdown_signal,
    worker_state::WorkerState,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker terminated");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), WorkerError> {
    tracing::info!("Starting cell analysis worker");

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        queue = %config.broker.analysis_queue,
        storage = %config.storage.endpoint,
        model = %config.model.path,
        "Configuration loaded"
    );

    if let Some(addr) = config.worker.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| WorkerError::Metrics(e.to_string()))?;
        describe_metrics();
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    // Model load failure is fatal before any broker traffic
    tracing::info!("Loading detection model");
    let engine = InferenceEngine::new(OnnxDetector::load(&config.model)?);

    tracing::info!("Connecting to PostgreSQL");
    let pool = db::init_pool(&config.database).await?;

    tracing::info!("Initializing object storage client");
    let storage = S3ObjectStore::new(&config.storage)?;

    let state = WorkerState::new(PgJobStore::new(pool), storage, engine);

    let connection = broker::connect(&config.broker).await?;
    let consumed = broker::consume(
        &connection,
        &config.broker.analysis_queue,
        &state,
        shutdown_signal(),
    )
    .await;

    if let Err(e) = connection.close(200, "worker shutdown").await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }

    let stats = consumed?;
    tracing::info!(
        delivered = stats.delivered,
        acked = stats.acked,
        rejected = stats.rejected,
        "Connection closed, worker stopped"
    );
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "analysis_jobs_completed_total",
        "Analysis jobs completed with a stored result"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed_total",
        "Analysis job deliveries rejected, by failure kind"
    );
    metrics::describe_counter!(
        "analysis_detections_total",
        "Cells detected across completed jobs"
    );
    metrics::describe_histogram!(
        "analysis_job_duration_seconds",
        "Time from claiming a job to storing its result"
    );
}
