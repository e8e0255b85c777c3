//! In-memory registry of in-flight transcode jobs
//!
//! The tracker is volatile: on restart it is empty, and truth is rebuilt
//! from the durable artifact index by [`JobTracker::reconcile_on_startup`].
//! Any `active` artifact whose owning job is not tracked is reclassified
//! orphaned, never deleted directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{age_since, ArtifactKind, ArtifactStore, ReleaseOutcome, StoreError};

/// Terminal outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// Errors surfaced by the job tracker
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Caller-side race or programming error: surfaced, never swallowed
    #[error("job {0} is already tracked")]
    DuplicateJob(Uuid),

    #[error("job {0} is not tracked")]
    UnknownJob(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
struct TrackedJob {
    started: DateTime<Utc>,
    artifacts: Vec<Uuid>,
}

impl TrackedJob {
    fn age(&self) -> Duration {
        age_since(self.started, Utc::now())
    }
}

/// Result of the startup reconciliation pass
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    /// Distinct vanished jobs whose artifacts were reclassified
    pub orphaned_jobs: usize,
    /// Artifacts transitioned `active -> orphaned`
    pub orphaned_artifacts: usize,
    /// On-disk files adopted into the index as orphans
    pub adopted_files: usize,
}

/// Registry of running jobs; owns the job side of the artifact lifecycle
pub struct JobTracker {
    store: Arc<ArtifactStore>,
    jobs: Mutex<HashMap<Uuid, TrackedJob>>,
}

impl JobTracker {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a running job
    pub fn begin(&self, job: Uuid) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job) {
            return Err(TrackerError::DuplicateJob(job));
        }
        jobs.insert(
            job,
            TrackedJob {
                started: Utc::now(),
                artifacts: Vec::new(),
            },
        );
        debug!(job = %job, "Job started");
        Ok(())
    }

    /// Record that the job owns an artifact, so `end` can release it
    pub fn attach(&self, job: Uuid, artifact: Uuid) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.lock();
        let tracked = jobs.get_mut(&job).ok_or(TrackerError::UnknownJob(job))?;
        tracked.artifacts.push(artifact);
        Ok(())
    }

    /// Transition the job to its terminal state, release its artifacts,
    /// and drop it from the tracker.
    ///
    /// The completion/cancellation race means `end` can be delivered twice;
    /// the second call finds the job gone and is a no-op.
    pub fn end(&self, job: Uuid, outcome: JobOutcome) -> Result<(), TrackerError> {
        let Some(tracked) = self.jobs.lock().remove(&job) else {
            debug!(job = %job, "Job already ended, ignoring");
            return Ok(());
        };

        // Release outside the tracker lock: store persistence does I/O.
        for id in tracked.artifacts.iter().copied() {
            let release_as = match self.store.get(id).map(|a| a.kind) {
                Some(ArtifactKind::Log) => ReleaseOutcome::RetainAsLog,
                _ => ReleaseOutcome::Discard,
            };
            if let Err(e) = self.store.release(id, release_as) {
                warn!(job = %job, artifact = %id, error = %e, "Failed to release artifact");
            }
        }

        info!(
            job = %job,
            outcome = ?outcome,
            elapsed_secs = tracked.age().as_secs(),
            "Job ended"
        );
        Ok(())
    }

    /// Rebuild truth from the durable index after a restart.
    ///
    /// Adopts stray files under the managed roots, then reclassifies every
    /// `active` artifact with no running owner as orphaned.
    pub fn reconcile_on_startup(&self) -> Result<ReconcileReport, TrackerError> {
        let mut report = ReconcileReport {
            adopted_files: self.store.adopt_untracked()?,
            ..Default::default()
        };

        let tracked: Vec<Uuid> = self.jobs.lock().keys().copied().collect();
        let mut vanished: Vec<Uuid> = self
            .store
            .list(&[crate::store::ArtifactState::Active])
            .into_iter()
            .filter_map(|a| a.job)
            .filter(|job| !tracked.contains(job))
            .collect();
        vanished.sort();
        vanished.dedup();

        for job in vanished {
            let affected = self.store.mark_orphaned(job)?;
            if !affected.is_empty() {
                report.orphaned_jobs += 1;
                report.orphaned_artifacts += affected.len();
            }
        }

        if report.orphaned_artifacts > 0 || report.adopted_files > 0 {
            info!(
                orphaned_jobs = report.orphaned_jobs,
                orphaned_artifacts = report.orphaned_artifacts,
                adopted_files = report.adopted_files,
                "Startup reconciliation complete"
            );
        }
        Ok(report)
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Age of the longest-running tracked job, if any
    pub fn oldest_active_age(&self) -> Option<Duration> {
        self.jobs.lock().values().map(TrackedJob::age).max()
    }

    /// Bounded-wait snapshot of `(active_count, oldest_active_age)` for the
    /// health reporter; `None` means the tracker lock was contended.
    pub fn try_snapshot(&self, wait: Duration) -> Option<(usize, Option<Duration>)> {
        let jobs = self.jobs.try_lock_for(wait)?;
        let oldest = jobs.values().map(TrackedJob::age).max();
        Some((jobs.len(), oldest))
    }

    /// Test hook: pretend a job started `age` ago
    #[cfg(test)]
    pub(crate) fn backdate_started(&self, job: Uuid, age: Duration) {
        if let Some(tracked) = self.jobs.lock().get_mut(&job) {
            tracked.started = Utc::now() - chrono::Duration::from_std(age).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::store::{ArtifactState, RetentionPolicy};

    fn open_store(dir: &std::path::Path) -> Arc<ArtifactStore> {
        let temp = dir.join("temp");
        let logs = dir.join("logs");
        fs::create_dir_all(&temp).unwrap();
        fs::create_dir_all(&logs).unwrap();
        let policy = RetentionPolicy {
            temp_max_age: Duration::from_secs(3600),
            log_max_age: Duration::from_secs(86400),
            temp_max_bytes: 1024 * 1024,
            log_max_bytes: 1024 * 1024,
            orphan_grace: Duration::from_secs(600),
        };
        Arc::new(ArtifactStore::open(temp, logs, dir.join("artifacts.json"), policy).unwrap())
    }

    #[test]
    fn duplicate_begin_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = JobTracker::new(open_store(dir.path()));

        let job = Uuid::new_v4();
        tracker.begin(job).unwrap();
        assert!(matches!(
            tracker.begin(job),
            Err(TrackerError::DuplicateJob(id)) if id == job
        ));
    }

    #[test]
    fn end_releases_owned_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let tracker = JobTracker::new(store.clone());

        let job = Uuid::new_v4();
        tracker.begin(job).unwrap();
        let temp = store.allocate(job, ArtifactKind::Temp).unwrap();
        let log = store.allocate(job, ArtifactKind::Log).unwrap();
        tracker.attach(job, temp.id).unwrap();
        tracker.attach(job, log.id).unwrap();

        tracker.end(job, JobOutcome::Succeeded).unwrap();

        assert_eq!(tracker.active_count(), 0);
        assert_eq!(store.get(temp.id).unwrap().state, ArtifactState::Reclaimable);
        let log = store.get(log.id).unwrap();
        assert_eq!(log.state, ArtifactState::Reclaimable);
        assert_eq!(log.job, None);
    }

    #[test]
    fn double_end_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let tracker = JobTracker::new(store.clone());

        let job = Uuid::new_v4();
        tracker.begin(job).unwrap();
        let artifact = store.allocate(job, ArtifactKind::Temp).unwrap();
        tracker.attach(job, artifact.id).unwrap();

        tracker.end(job, JobOutcome::Succeeded).unwrap();
        let touched = store.get(artifact.id).unwrap().last_touched_at;

        // Cancellation arriving after natural completion
        tracker.end(job, JobOutcome::Failed).unwrap();
        assert_eq!(store.get(artifact.id).unwrap().last_touched_at, touched);
    }

    #[test]
    fn attach_to_unknown_job_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = JobTracker::new(open_store(dir.path()));
        assert!(matches!(
            tracker.attach(Uuid::new_v4(), Uuid::new_v4()),
            Err(TrackerError::UnknownJob(_))
        ));
    }

    #[test]
    fn reconcile_orphans_artifacts_of_vanished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        // A previous process allocated and then crashed
        let dead_job = Uuid::new_v4();
        let artifact = store.allocate(dead_job, ArtifactKind::Temp).unwrap();
        fs::write(&artifact.path, b"half-written").unwrap();

        // Fresh tracker, as after restart
        let tracker = JobTracker::new(store.clone());
        let report = tracker.reconcile_on_startup().unwrap();

        assert_eq!(report.orphaned_jobs, 1);
        assert_eq!(report.orphaned_artifacts, 1);
        assert_eq!(store.get(artifact.id).unwrap().state, ArtifactState::Orphaned);
    }

    #[test]
    fn reconcile_keeps_artifacts_of_tracked_jobs_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let tracker = JobTracker::new(store.clone());

        let job = Uuid::new_v4();
        tracker.begin(job).unwrap();
        let artifact = store.allocate(job, ArtifactKind::Temp).unwrap();
        tracker.attach(job, artifact.id).unwrap();

        let report = tracker.reconcile_on_startup().unwrap();
        assert_eq!(report.orphaned_artifacts, 0);
        assert_eq!(store.get(artifact.id).unwrap().state, ArtifactState::Active);
    }

    #[test]
    fn oldest_active_age_tracks_the_longest_runner() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = JobTracker::new(open_store(dir.path()));

        assert!(tracker.oldest_active_age().is_none());

        let old = Uuid::new_v4();
        let young = Uuid::new_v4();
        tracker.begin(old).unwrap();
        tracker.begin(young).unwrap();
        tracker.backdate_started(old, Duration::from_secs(900));

        let age = tracker.oldest_active_age().unwrap();
        assert!(age >= Duration::from_secs(900));
        assert_eq!(tracker.active_count(), 2);
    }
}
