//! Standalone cleanup entry point
//!
//! Runs exactly one reaper sweep against the shared durable index, for
//! operator- or cron-triggered reclamation outside the worker's loop.
//! Safe to run while the worker is up: both processes coordinate through
//! atomic index writes and rename-before-delete, never shared memory.
//! Exits non-zero if any deletion failed so external schedulers can alert
//! on persistent failures.

use std::sync::Arc;

use anileech::config::Config;
use anileech::jobs::reaper::{Reaper, ReaperStatus};
use anileech::store::ArtifactStore;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anileech=info".into()),
        )
        .compact()
        .init();

    let store = Arc::new(ArtifactStore::open(
        &config.temp_dir,
        &config.logs_dir,
        &config.index_path,
        config.retention_policy(),
    )?);

    // Pick up files a crashed worker never registered; they become
    // orphans and fall to a later sweep once the grace period passes.
    let adopted = store.adopt_untracked()?;
    if adopted > 0 {
        tracing::info!(adopted, "Adopted untracked files");
    }

    let reaper = Reaper::new(store, Arc::new(ReaperStatus::new()));
    let report = reaper.sweep();

    tracing::info!(
        deleted = report.deleted,
        failed = report.failed,
        reclaimed_bytes = report.reclaimed_bytes,
        "Cleanup sweep finished"
    );

    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
