// Main entry point for the podcast API server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use server_core::domains::waveforms::{
    waveform_coordinator, PodcastIndexDirectory, PostgresWaveformStore, TranscoderPeakSource,
    WaveformProcessor, WaveformStore,
};
use server_core::kernel::jobs::{
    JobService, PostgresJobStore, ProcessorRegistry, RetryPolicy, WorkerPool, WorkerPoolConfig,
};
use server_core::server::{build_app, AppState};
use server_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Podcast Player API");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Queue and artifact stores
    let job_store = Arc::new(PostgresJobStore::new(pool.clone()));
    let jobs = Arc::new(JobService::with_retry_policy(
        job_store,
        RetryPolicy {
            min_delay: Duration::from_secs(config.min_retry_delay_secs),
            max_delay: Duration::from_secs(config.max_retry_delay_secs),
        },
    ));
    let waveforms: Arc<dyn WaveformStore> = Arc::new(PostgresWaveformStore::new(pool.clone()));

    // Processors
    let directory = Arc::new(PodcastIndexDirectory::new(config.podcast_index_base_url.clone()));
    let peak_source = Arc::new(TranscoderPeakSource::new(directory, config.transcoder_bin.clone()));
    let mut registry = ProcessorRegistry::new();
    registry.register(Arc::new(WaveformProcessor::new(
        peak_source,
        waveforms.clone(),
    )));

    // Worker pool
    let worker_pool = WorkerPool::with_config(
        jobs.clone(),
        Arc::new(registry),
        WorkerPoolConfig {
            workers: config.worker_count,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            stall_multiplier: config.stall_multiplier,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            job_timeout: config.job_timeout_secs.map(Duration::from_secs),
            ..WorkerPoolConfig::default()
        },
    );
    let pool_handle = worker_pool.start();

    // HTTP application
    let coordinator = Arc::new(waveform_coordinator(waveforms.clone(), jobs.clone()));
    let app = build_app(AppState {
        jobs,
        waveforms,
        waveform_requests: coordinator,
        db_pool: Some(pool),
    });

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
        })
        .await
        .context("Server error")?;

    // Drain in-flight jobs before exiting
    pool_handle.shutdown().await;

    Ok(())
}
