//! Health and metrics endpoints
//!
//! Liveness and readiness are derived on every query from the job tracker,
//! the artifact store and the reaper's sweep record - never from a
//! hardcoded "ok". Evaluation waits at most a short bounded time on store
//! locks; if a sweep is hogging them the endpoint answers `ready=false,
//! reason=busy` instead of hanging past the orchestrator's timeout.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sysinfo::{Disks, System};
use tracing::error;

use crate::AppState;
use crate::store::{ArtifactKind, StoreUsage};

/// Upper bound on lock waits during health evaluation
const LOCK_WAIT: Duration = Duration::from_millis(250);

/// Derived health signal; recomputed per query, never cached
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Full health evaluation, including component detail for operators
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    #[serde(flatten)]
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub jobs: JobsHealth,
    pub store: StoreHealth,
    pub reaper: ReaperHealth,
}

#[derive(Debug, Serialize)]
pub struct JobsHealth {
    pub active: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_active_secs: Option<u64>,
    pub queue_depth: usize,
    pub processed_total: u64,
    pub failed_total: u64,
}

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub temp: StoreUsage,
    pub logs: StoreUsage,
    pub temp_cap_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct ReaperHealth {
    pub last_sweep_age_secs: u64,
}

/// Evaluate health from live component state
pub fn evaluate(state: &AppState) -> HealthReport {
    let sweep_age = state.reaper_status.age_of_last_sweep();
    let live = sweep_age <= 2 * state.config.sweep_interval;

    let Some(temp) = state.store.try_usage(ArtifactKind::Temp, LOCK_WAIT) else {
        return busy_report(live);
    };
    let Some(logs) = state.store.try_usage(ArtifactKind::Log, LOCK_WAIT) else {
        return busy_report(live);
    };
    let Some((active, oldest)) = state.tracker.try_snapshot(LOCK_WAIT) else {
        return busy_report(live);
    };

    let temp_cap = state.store.policy().size_cap(ArtifactKind::Temp);
    let reason = if !live {
        Some(format!(
            "reaper stalled: last sweep {}s ago",
            sweep_age.as_secs()
        ))
    } else if temp.bytes >= temp_cap {
        Some(format!(
            "temp store full: {} of {} bytes in use",
            temp.bytes, temp_cap
        ))
    } else if let Some(age) = oldest
        && age > state.config.stuck_job_threshold
    {
        Some(format!("stuck job: oldest running for {}s", age.as_secs()))
    } else {
        None
    };

    let ready = reason.is_none();
    HealthReport {
        status: if ready { "healthy" } else { "degraded" },
        health: HealthStatus {
            live,
            ready,
            reason,
        },
        components: Some(ComponentHealth {
            jobs: JobsHealth {
                active,
                oldest_active_secs: oldest.map(|d| d.as_secs()),
                queue_depth: state.pool.queue_depth(),
                processed_total: state.pool.processed(),
                failed_total: state.pool.failed(),
            },
            store: StoreHealth {
                temp,
                logs,
                temp_cap_bytes: temp_cap,
            },
            reaper: ReaperHealth {
                last_sweep_age_secs: sweep_age.as_secs(),
            },
        }),
    }
}

fn busy_report(live: bool) -> HealthReport {
    HealthReport {
        status: "degraded",
        health: HealthStatus {
            live,
            ready: false,
            reason: Some("busy".to_string()),
        },
        components: None,
    }
}

/// `GET /health` - 200 when ready, 503 with a reason otherwise
async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    // An evaluation panic must surface as not-ready, never as a hung or
    // crashed endpoint.
    let report = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        evaluate(&state)
    })) {
        Ok(report) => report,
        Err(_) => {
            error!("Health evaluation panicked");
            HealthReport {
                status: "error",
                health: HealthStatus {
                    live: true,
                    ready: false,
                    reason: Some("health-check-error".to_string()),
                },
                components: None,
            }
        }
    };

    let code = if report.health.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// `GET /metrics` - Prometheus-style plaintext
async fn metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    let mut lines: Vec<String> = Vec::new();

    let mut sys = System::new();
    sys.refresh_memory();
    lines.push(format!("system_memory_total_bytes {}", sys.total_memory()));
    lines.push(format!(
        "system_memory_available_bytes {}",
        sys.available_memory()
    ));

    if let Some((total, free)) = disk_space_for(&state.config.temp_dir) {
        lines.push(format!("system_disk_total_bytes {total}"));
        lines.push(format!("system_disk_free_bytes {free}"));
    }

    let temp = state.store.usage(ArtifactKind::Temp);
    let logs = state.store.usage(ArtifactKind::Log);
    lines.push(format!("bot_queue_size {}", state.pool.queue_depth()));
    lines.push(format!("bot_active_jobs {}", state.tracker.active_count()));
    lines.push(format!("bot_processed_total {}", state.pool.processed()));
    lines.push(format!("bot_failed_total {}", state.pool.failed()));
    lines.push(format!("bot_temp_usage_bytes {}", temp.bytes));
    lines.push(format!("bot_temp_files {}", temp.files));
    lines.push(format!("bot_log_usage_bytes {}", logs.bytes));
    lines.push(format!(
        "bot_last_sweep_age_seconds {}",
        state.reaper_status.age_of_last_sweep().as_secs()
    ));

    lines.join("\n")
}

/// Total and available space of the disk holding `path`
fn disk_space_for(path: &std::path::Path) -> Option<(u64, u64)> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.total_space(), d.available_space()))
}

async fn root() -> &'static str {
    "Anileech worker\n\n\
     Endpoints:\n\
     \x20 /health   - Liveness and readiness\n\
     \x20 /metrics  - Prometheus metrics\n"
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}
