//! Artifact reaper: the only component that deletes files
//!
//! One sweep snapshots the reclaimable and orphaned artifacts under a
//! short-held lock, then performs deletions outside any lock so file
//! removal latency never blocks job allocation. The same sweep runs on a
//! timer inside the worker and exactly once in the standalone cleanup
//! binary.

use std::fs;
use std::io;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::store::{age_since, Artifact, ArtifactKind, ArtifactState, ArtifactStore};

/// Shared record of sweep completion, consumed by the health reporter
pub struct ReaperStatus {
    started: DateTime<Utc>,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl ReaperStatus {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            last_sweep: Mutex::new(None),
        }
    }

    fn record_sweep(&self) {
        *self.last_sweep.lock() = Some(Utc::now());
    }

    /// Time since the last completed sweep; before the first sweep this is
    /// time since process start, so a freshly booted worker is not marked
    /// dead while the first interval elapses.
    pub fn age_of_last_sweep(&self) -> Duration {
        let anchor = self.last_sweep.lock().unwrap_or(self.started);
        age_since(anchor, Utc::now())
    }

    /// Test hook: pretend the last sweep completed `age` ago
    #[cfg(test)]
    pub(crate) fn backdate_sweep(&self, age: Duration) {
        *self.last_sweep.lock() =
            Some(Utc::now() - chrono::Duration::from_std(age).unwrap());
    }
}

impl Default for ReaperStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub deleted: usize,
    pub failed: usize,
    pub reclaimed_bytes: u64,
}

/// Deletes artifacts past retention; never touches `active` entries
pub struct Reaper {
    store: Arc<ArtifactStore>,
    status: Arc<ReaperStatus>,
}

impl Reaper {
    pub fn new(store: Arc<ArtifactStore>, status: Arc<ReaperStatus>) -> Self {
        Self { store, status }
    }

    /// Run one sweep over the reclaimable and orphaned artifacts.
    ///
    /// Deletion failures are logged and skipped, not retried within the
    /// sweep; the entry stays in the index and is retried next time.
    pub fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let policy = self.store.policy().clone();
        let snapshot = self
            .store
            .list(&[ArtifactState::Reclaimable, ArtifactState::Orphaned]);

        let mut report = SweepReport::default();
        let mut survivors: Vec<Artifact> = Vec::new();

        for artifact in snapshot {
            let due = match artifact.state {
                ArtifactState::Orphaned => {
                    // Grace period absorbs false positives during restart
                    // reconciliation; anchored at classification time.
                    let anchor = artifact.orphaned_at.unwrap_or(artifact.created_at);
                    age_since(anchor, now) > policy.orphan_grace
                }
                ArtifactState::Reclaimable => {
                    age_since(artifact.last_touched_at, now) > policy.max_age(artifact.kind)
                }
                ArtifactState::Active => false,
            };

            if due {
                self.delete(&artifact, &mut report);
            } else {
                survivors.push(artifact);
            }
        }

        // Size-cap pass: evict oldest reclaimable temp artifacts until the
        // aggregate is back under its cap. Logs are never size-evicted so
        // the audit trail cannot be lost under load.
        let cap = policy.size_cap(ArtifactKind::Temp);
        let mut aggregate = self.store.usage(ArtifactKind::Temp).bytes;
        if aggregate > cap {
            let mut evictable: Vec<&Artifact> = survivors
                .iter()
                .filter(|a| {
                    a.kind == ArtifactKind::Temp && a.state == ArtifactState::Reclaimable
                })
                .collect();
            evictable.sort_by_key(|a| a.last_touched_at);

            for artifact in evictable {
                if aggregate <= cap {
                    break;
                }
                let size = artifact.size_bytes;
                self.delete(artifact, &mut report);
                aggregate = aggregate.saturating_sub(size);
            }
        }

        self.status.record_sweep();
        info!(
            deleted = report.deleted,
            failed = report.failed,
            reclaimed_bytes = report.reclaimed_bytes,
            "Reaper sweep completed"
        );
        report
    }

    fn delete(&self, artifact: &Artifact, report: &mut SweepReport) {
        match remove_artifact_file(artifact) {
            Ok(()) => {
                if let Err(e) = self.store.forget(artifact.id) {
                    warn!(artifact = %artifact.id, error = %e, "Failed to drop index entry");
                    report.failed += 1;
                } else {
                    report.deleted += 1;
                    report.reclaimed_bytes += artifact.size_bytes;
                    debug!(
                        artifact = %artifact.id,
                        path = %artifact.path.display(),
                        kind = %artifact.kind,
                        "Deleted artifact"
                    );
                }
            }
            Err(e) => {
                warn!(
                    artifact = %artifact.id,
                    path = %artifact.path.display(),
                    error = %e,
                    "Failed to delete artifact, will retry next sweep"
                );
                report.failed += 1;
            }
        }
    }
}

/// Delete the file behind an artifact, coordinating with a concurrent
/// sweeper through rename-before-delete: the path is first renamed to a
/// process-unique claim name, so two sweeps can never half-delete the same
/// file. A path that is already gone counts as deleted.
fn remove_artifact_file(artifact: &Artifact) -> io::Result<()> {
    let claim = artifact
        .path
        .with_file_name(format!(
            "{}.{}.reaped",
            artifact.id,
            process::id()
        ));

    match fs::rename(&artifact.path, &claim) {
        Ok(()) => {}
        // Another sweep claimed or deleted it first
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    if let Err(e) = fs::remove_file(&claim) {
        // Put the file back under its original name: the index entry still
        // points there, so the next sweep's rename finds it and retries.
        let _ = fs::rename(&claim, &artifact.path);
        return Err(e);
    }

    // Drop the per-job subtree once it empties out
    if artifact.kind == ArtifactKind::Temp
        && let Some(parent) = artifact.path.parent()
        && fs::read_dir(parent).map(|mut d| d.next().is_none()).unwrap_or(false)
    {
        let _ = fs::remove_dir(parent);
    }
    Ok(())
}
