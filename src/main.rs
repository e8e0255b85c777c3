//! Anileech worker - long-lived transcode service
//!
//! Boots the artifact store from the durable index, reconciles crash
//! leftovers, starts the reaper schedule and the transcode worker pool,
//! and serves the health/metrics endpoints for the container healthcheck.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anileech::config::Config;
use anileech::jobs::reaper::{Reaper, ReaperStatus};
use anileech::media::transcoder::Transcoder;
use anileech::services::tracker::JobTracker;
use anileech::services::worker::{TranscodePool, WorkerPoolConfig};
use anileech::store::ArtifactStore;
use anileech::{AppState, api, jobs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let config = Arc::new(config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anileech=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting anileech worker");

    // The working directories are provisioned by the deployment, not here
    anyhow::ensure!(
        config.temp_dir.is_dir(),
        "temp directory {} does not exist",
        config.temp_dir.display()
    );
    anyhow::ensure!(
        config.logs_dir.is_dir(),
        "logs directory {} does not exist",
        config.logs_dir.display()
    );

    let store = Arc::new(ArtifactStore::open(
        &config.temp_dir,
        &config.logs_dir,
        &config.index_path,
        config.retention_policy(),
    )?);
    tracing::info!("Artifact store opened");

    let tracker = Arc::new(JobTracker::new(store.clone()));
    let report = tracker.reconcile_on_startup()?;
    tracing::info!(
        orphaned_jobs = report.orphaned_jobs,
        orphaned_artifacts = report.orphaned_artifacts,
        adopted_files = report.adopted_files,
        "Startup reconciliation done"
    );

    let reaper_status = Arc::new(ReaperStatus::new());
    let reaper = Arc::new(Reaper::new(store.clone(), reaper_status.clone()));
    let _scheduler = jobs::start_scheduler(reaper, config.sweep_interval).await?;

    let transcoder = Arc::new(Transcoder::new(
        config.ffmpeg_path.clone(),
        config.ffmpeg_timeout,
    ));
    let pool = Arc::new(TranscodePool::start(
        WorkerPoolConfig {
            max_concurrent: config.max_concurrent_jobs,
            queue_capacity: config.queue_capacity,
        },
        tracker.clone(),
        store.clone(),
        transcoder,
    ));
    tracing::info!("Transcode pool started");

    let state = AppState {
        config: config.clone(),
        store,
        tracker,
        reaper_status,
        pool,
    };

    let app = api::health::router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    } else {
        tracing::info!("Shutdown signal received");
    }
}
