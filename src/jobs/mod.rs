//! Background job scheduling

pub mod reaper;

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use self::reaper::Reaper;

/// Initialize and start the job scheduler.
///
/// The reaper sweep runs on a fixed interval; sweep completion feeds the
/// liveness signal, so a wedged scheduler surfaces as live=false.
pub async fn start_scheduler(
    reaper: Arc<Reaper>,
    sweep_interval: Duration,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let reaper_job = Job::new_repeated_async(sweep_interval, move |_uuid, _l| {
        let reaper = reaper.clone();
        Box::pin(async move {
            info!("Running reaper sweep");
            // Deletions are blocking filesystem work
            match tokio::task::spawn_blocking(move || reaper.sweep()).await {
                Ok(report) => {
                    if report.failed > 0 {
                        tracing::warn!(
                            deleted = report.deleted,
                            failed = report.failed,
                            "Reaper sweep finished with failures"
                        );
                    }
                }
                Err(e) => tracing::error!("Reaper sweep panicked: {}", e),
            }
        })
    })?;
    scheduler.add(reaper_job).await?;

    scheduler.start().await?;

    info!("Job scheduler started");
    Ok(scheduler)
}
