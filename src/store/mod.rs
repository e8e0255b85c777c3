//! Filesystem-backed artifact registry
//!
//! Every file the worker produces under `temp/` or `logs/` is registered
//! here with an owner job and a lifecycle state. State transitions are
//! strictly monotonic (`active -> reclaimable | orphaned`); the store never
//! deletes files itself - that is the reaper's job. Mutations are guarded
//! by a per-kind lock so temp allocation never blocks log allocation, and
//! every mutation is persisted to the durable index shared with the
//! standalone cleanup process.

pub mod index;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use self::index::DiskIndex;

/// What kind of file an artifact is, with kind-specific retention rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Transient working file, evicted by age or by aggregate size
    Temp,
    /// Append-only job log, evicted by age only
    Log,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Temp => write!(f, "temp"),
            ArtifactKind::Log => write!(f, "log"),
        }
    }
}

/// Lifecycle state of a tracked artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    /// Owned by a running job; never deleted
    Active,
    /// Released by its job; eligible for reclamation
    Reclaimable,
    /// Owning job vanished without releasing; deleted only after the grace period
    Orphaned,
}

/// One tracked file under `temp/` or `logs/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// Owning job; `None` once the artifact outlives its job (adopted orphans)
    pub job: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Touch is job completion, not read access
    pub last_touched_at: DateTime<Utc>,
    /// Set when the artifact was classified orphaned; anchors the grace period
    pub orphaned_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub state: ArtifactState,
}

/// How a job released an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Working file no longer needed; reclaim on the next sweep
    Discard,
    /// Keep on disk as an audit log, subject to age-based reclamation only
    RetainAsLog,
}

/// Kind-specific retention configuration, immutable after load
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub temp_max_age: Duration,
    pub log_max_age: Duration,
    pub temp_max_bytes: u64,
    pub log_max_bytes: u64,
    pub orphan_grace: Duration,
}

impl RetentionPolicy {
    pub fn max_age(&self, kind: ArtifactKind) -> Duration {
        match kind {
            ArtifactKind::Temp => self.temp_max_age,
            ArtifactKind::Log => self.log_max_age,
        }
    }

    pub fn size_cap(&self, kind: ArtifactKind) -> u64 {
        match kind {
            ArtifactKind::Temp => self.temp_max_bytes,
            ArtifactKind::Log => self.log_max_bytes,
        }
    }
}

/// Errors surfaced by the artifact store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Allocation rejected: the kind's aggregate size cap is already met.
    /// Recovered by backpressure, not fatal.
    #[error("{kind} store is full: {used} of {cap} bytes in use")]
    StoreFull {
        kind: ArtifactKind,
        used: u64,
        cap: u64,
    },

    #[error("unknown artifact {0}")]
    UnknownArtifact(Uuid),

    #[error("artifact store I/O failed")]
    Io(#[from] std::io::Error),
}

/// Aggregate usage of one artifact kind
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreUsage {
    pub bytes: u64,
    pub files: usize,
}

#[derive(Default)]
struct KindIndex {
    entries: HashMap<Uuid, Artifact>,
}

impl KindIndex {
    /// Aggregate bytes, statting `active` entries: their recorded size lags
    /// behind what a running job has already written, and the size cap has
    /// to backpressure while the bytes pile up, not after release.
    fn used_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|a| match a.state {
                ArtifactState::Active => {
                    fs::metadata(&a.path).map(|m| m.len()).unwrap_or(a.size_bytes)
                }
                _ => a.size_bytes,
            })
            .sum()
    }
}

/// Registry of every tracked file, backed by the durable on-disk index
pub struct ArtifactStore {
    temp_root: PathBuf,
    log_root: PathBuf,
    policy: RetentionPolicy,
    // Lock order: temp before logs, always.
    temp: Mutex<KindIndex>,
    logs: Mutex<KindIndex>,
    // Ids this process deleted; keeps the persist merge from resurrecting
    // them out of another process's stale write.
    forgotten: Mutex<HashSet<Uuid>>,
    disk: DiskIndex,
}

impl ArtifactStore {
    /// Open the store, loading any existing durable index.
    ///
    /// A corrupt index is logged and treated as empty: the files it
    /// described are still on disk and get re-adopted as orphans by
    /// [`ArtifactStore::adopt_untracked`].
    pub fn open(
        temp_root: impl AsRef<Path>,
        log_root: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
        policy: RetentionPolicy,
    ) -> Result<Self, StoreError> {
        let disk = DiskIndex::new(index_path.as_ref());
        let entries = match disk.load() {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(
                    path = %disk.path().display(),
                    error = %e,
                    "Artifact index is corrupt, starting empty"
                );
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut temp = KindIndex::default();
        let mut logs = KindIndex::default();
        for artifact in entries {
            match artifact.kind {
                ArtifactKind::Temp => temp.entries.insert(artifact.id, artifact),
                ArtifactKind::Log => logs.entries.insert(artifact.id, artifact),
            };
        }

        info!(
            temp_entries = temp.entries.len(),
            log_entries = logs.entries.len(),
            "Artifact store opened"
        );

        Ok(Self {
            temp_root: temp_root.as_ref().to_path_buf(),
            log_root: log_root.as_ref().to_path_buf(),
            policy,
            temp: Mutex::new(temp),
            logs: Mutex::new(logs),
            forgotten: Mutex::new(HashSet::new()),
            disk,
        })
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Register a new `active` artifact owned by `job`.
    ///
    /// The path is reserved (parent directory created for temp subtrees)
    /// but the file itself is written by the caller. Fails with
    /// [`StoreError::StoreFull`] when the kind's aggregate size cap is
    /// already met - the caller must back off until the reaper frees space.
    pub fn allocate(&self, job: Uuid, kind: ArtifactKind) -> Result<Artifact, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();

        let artifact = {
            let mut guard = self.kind_index(kind).lock();

            let used = guard.used_bytes();
            let cap = self.policy.size_cap(kind);
            if used >= cap {
                return Err(StoreError::StoreFull { kind, used, cap });
            }

            let path = match kind {
                ArtifactKind::Temp => {
                    let dir = self.temp_root.join(job.to_string());
                    fs::create_dir_all(&dir)?;
                    dir.join(format!("{id}.tmp"))
                }
                ArtifactKind::Log => {
                    let plain = self.log_root.join(format!("{job}.log"));
                    if guard.entries.values().any(|a| a.path == plain) {
                        self.log_root.join(format!("{job}-{id}.log"))
                    } else {
                        plain
                    }
                }
            };

            let artifact = Artifact {
                id,
                path,
                kind,
                job: Some(job),
                created_at: now,
                last_touched_at: now,
                orphaned_at: None,
                size_bytes: 0,
                state: ArtifactState::Active,
            };
            guard.entries.insert(id, artifact.clone());
            artifact
        };

        self.persist()?;
        debug!(artifact = %id, job = %job, kind = %kind, path = %artifact.path.display(), "Allocated artifact");
        Ok(artifact)
    }

    /// Transition an `active` artifact to `reclaimable`.
    ///
    /// Records the file's current size and touch time. Releasing an
    /// already-released artifact is a no-op, never an error, so the
    /// completion/cancellation race cannot double-free size accounting.
    pub fn release(&self, id: Uuid, outcome: ReleaseOutcome) -> Result<(), StoreError> {
        let released = {
            let mut guard = match self.find_kind(id) {
                Some(kind) => self.kind_index(kind).lock(),
                None => return Err(StoreError::UnknownArtifact(id)),
            };
            let Some(artifact) = guard.entries.get_mut(&id) else {
                return Err(StoreError::UnknownArtifact(id));
            };

            if artifact.state != ArtifactState::Active {
                // Idempotent second release
                return Ok(());
            }

            artifact.size_bytes = fs::metadata(&artifact.path).map(|m| m.len()).unwrap_or(0);
            artifact.last_touched_at = Utc::now();
            artifact.state = ArtifactState::Reclaimable;
            if outcome == ReleaseOutcome::RetainAsLog {
                // The log outlives its job
                artifact.job = None;
            }
            artifact.clone()
        };

        self.persist()?;
        debug!(
            artifact = %id,
            kind = %released.kind,
            outcome = ?outcome,
            size_bytes = released.size_bytes,
            "Released artifact"
        );
        Ok(())
    }

    /// Transition all of a vanished job's `active` artifacts to `orphaned`.
    ///
    /// Returns the affected artifact ids. The grace period is anchored at
    /// the moment of classification, not file creation, so a sweep during a
    /// worker restart cannot destroy a file mid-reconcile.
    pub fn mark_orphaned(&self, job: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let mut affected = Vec::new();

        for kind in [ArtifactKind::Temp, ArtifactKind::Log] {
            let mut guard = self.kind_index(kind).lock();
            for artifact in guard.entries.values_mut() {
                if artifact.job == Some(job) && artifact.state == ArtifactState::Active {
                    artifact.state = ArtifactState::Orphaned;
                    artifact.orphaned_at = Some(now);
                    artifact.size_bytes =
                        fs::metadata(&artifact.path).map(|m| m.len()).unwrap_or(0);
                    affected.push(artifact.id);
                }
            }
        }

        if !affected.is_empty() {
            self.persist()?;
            info!(job = %job, artifacts = affected.len(), "Marked job artifacts orphaned");
        }
        Ok(affected)
    }

    /// Walk the managed roots and adopt any file the index does not know
    /// about as an `orphaned` entry.
    ///
    /// This is how files written by a crashed worker (or left behind by an
    /// interrupted delete) re-enter the lifecycle: they become orphans and
    /// are reclaimed once the grace period passes.
    pub fn adopt_untracked(&self) -> Result<usize, StoreError> {
        let mut adopted = 0;
        for (kind, root) in [
            (ArtifactKind::Temp, self.temp_root.clone()),
            (ArtifactKind::Log, self.log_root.clone()),
        ] {
            adopted += self.adopt_root(kind, &root)?;
        }
        if adopted > 0 {
            self.persist()?;
            info!(adopted, "Adopted untracked files as orphans");
        }
        Ok(adopted)
    }

    fn adopt_root(&self, kind: ArtifactKind, root: &Path) -> Result<usize, StoreError> {
        if !root.is_dir() {
            return Ok(0);
        }

        let known: Vec<PathBuf> = {
            let guard = self.kind_index(kind).lock();
            guard.entries.values().map(|a| a.path.clone()).collect()
        };

        let now = Utc::now();
        let mut adopted = 0;
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();
            if known.contains(&path) {
                continue;
            }

            // A concurrent sweep may delete the file between the directory
            // listing and the stat; that is not a failed adoption.
            let Some(meta) = stat_for_adoption(&path)? else {
                continue;
            };
            let created_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| now);

            let artifact = Artifact {
                id: Uuid::new_v4(),
                path: path.clone(),
                kind,
                job: None,
                created_at,
                last_touched_at: created_at,
                orphaned_at: Some(now),
                size_bytes: meta.len(),
                state: ArtifactState::Orphaned,
            };
            debug!(path = %path.display(), kind = %kind, "Adopting untracked file");
            self.kind_index(kind).lock().entries.insert(artifact.id, artifact);
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Immutable snapshot of artifacts in any of the given states.
    ///
    /// Never returns live references: a concurrent delete cannot race the
    /// caller's view.
    pub fn list(&self, states: &[ArtifactState]) -> Vec<Artifact> {
        let mut out = Vec::new();
        for kind in [ArtifactKind::Temp, ArtifactKind::Log] {
            let guard = self.kind_index(kind).lock();
            out.extend(
                guard
                    .entries
                    .values()
                    .filter(|a| states.contains(&a.state))
                    .cloned(),
            );
        }
        out
    }

    /// Snapshot of every tracked artifact
    pub fn list_all(&self) -> Vec<Artifact> {
        self.list(&[
            ArtifactState::Active,
            ArtifactState::Reclaimable,
            ArtifactState::Orphaned,
        ])
    }

    pub fn get(&self, id: Uuid) -> Option<Artifact> {
        for kind in [ArtifactKind::Temp, ArtifactKind::Log] {
            if let Some(a) = self.kind_index(kind).lock().entries.get(&id) {
                return Some(a.clone());
            }
        }
        None
    }

    /// Aggregate size and file count for one kind
    pub fn usage(&self, kind: ArtifactKind) -> StoreUsage {
        let guard = self.kind_index(kind).lock();
        StoreUsage {
            bytes: guard.used_bytes(),
            files: guard.entries.len(),
        }
    }

    /// Like [`ArtifactStore::usage`] but gives up after `wait` instead of
    /// blocking behind a long-held lock. Used by the health reporter.
    pub fn try_usage(&self, kind: ArtifactKind, wait: Duration) -> Option<StoreUsage> {
        let guard = self.kind_index(kind).try_lock_for(wait)?;
        Some(StoreUsage {
            bytes: guard.used_bytes(),
            files: guard.entries.len(),
        })
    }

    /// Whether the kind's aggregate size has reached its cap
    pub fn at_capacity(&self, kind: ArtifactKind) -> bool {
        self.usage(kind).bytes >= self.policy.size_cap(kind)
    }

    /// Drop a deleted artifact from the index. Idempotent: forgetting an
    /// unknown id is a no-op (the cleanup process may have won the race).
    pub fn forget(&self, id: Uuid) -> Result<(), StoreError> {
        let removed = [ArtifactKind::Temp, ArtifactKind::Log]
            .into_iter()
            .any(|kind| self.kind_index(kind).lock().entries.remove(&id).is_some());
        if removed {
            self.forgotten.lock().insert(id);
            self.persist()?;
        }
        Ok(())
    }

    fn kind_index(&self, kind: ArtifactKind) -> &Mutex<KindIndex> {
        match kind {
            ArtifactKind::Temp => &self.temp,
            ArtifactKind::Log => &self.logs,
        }
    }

    fn find_kind(&self, id: Uuid) -> Option<ArtifactKind> {
        [ArtifactKind::Temp, ArtifactKind::Log]
            .into_iter()
            .find(|kind| self.kind_index(*kind).lock().entries.contains_key(&id))
    }

    /// Write the current in-memory state to the durable index.
    ///
    /// The index is shared with the standalone cleanup process, so this is
    /// a locked load-merge-save, not a blind overwrite: entries another
    /// process added since we loaded are carried over, entries this process
    /// deleted stay deleted. The advisory file lock makes the cycle atomic
    /// against the other process's persist.
    fn persist(&self) -> Result<(), StoreError> {
        let temp = self.temp.lock();
        let logs = self.logs.lock();
        let forgotten = self.forgotten.lock();

        let _index_lock = self.disk.lock()?;

        let mut snapshot: Vec<Artifact> = temp.entries.values().cloned().collect();
        snapshot.extend(logs.entries.values().cloned());

        let known: HashSet<Uuid> = snapshot.iter().map(|a| a.id).collect();
        let foreign = match self.disk.load() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Index unreadable during merge, writing own view");
                Vec::new()
            }
        };
        snapshot.extend(
            foreign
                .into_iter()
                .filter(|a| !known.contains(&a.id) && !forgotten.contains(&a.id)),
        );

        self.disk.save(&snapshot)?;
        Ok(())
    }

    /// Test hook: rewrite an artifact's timestamps to simulate age
    #[cfg(test)]
    pub(crate) fn backdate(
        &self,
        id: Uuid,
        last_touched_at: Option<DateTime<Utc>>,
        orphaned_at: Option<DateTime<Utc>>,
    ) {
        for kind in [ArtifactKind::Temp, ArtifactKind::Log] {
            let mut guard = self.kind_index(kind).lock();
            if let Some(artifact) = guard.entries.get_mut(&id) {
                if let Some(t) = last_touched_at {
                    artifact.last_touched_at = t;
                }
                if orphaned_at.is_some() {
                    artifact.orphaned_at = orphaned_at;
                }
            }
        }
    }
}

/// Elapsed wall-clock time since `t`, clamped to zero
pub(crate) fn age_since(t: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - t).to_std().unwrap_or(Duration::ZERO)
}

/// Stat a candidate for adoption; `None` when it vanished before the stat
fn stat_for_adoption(path: &Path) -> io::Result<Option<fs::Metadata>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_policy() -> RetentionPolicy {
        RetentionPolicy {
            temp_max_age: Duration::from_secs(3600),
            log_max_age: Duration::from_secs(86400),
            temp_max_bytes: 1024 * 1024,
            log_max_bytes: 1024 * 1024,
            orphan_grace: Duration::from_secs(600),
        }
    }

    fn open_store(dir: &Path, policy: RetentionPolicy) -> ArtifactStore {
        let temp = dir.join("temp");
        let logs = dir.join("logs");
        fs::create_dir_all(&temp).unwrap();
        fs::create_dir_all(&logs).unwrap();
        ArtifactStore::open(temp, logs, dir.join("artifacts.json"), policy).unwrap()
    }

    #[test]
    fn allocate_registers_active_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let job = Uuid::new_v4();
        let artifact = store.allocate(job, ArtifactKind::Temp).unwrap();

        assert_eq!(artifact.state, ArtifactState::Active);
        assert_eq!(artifact.job, Some(job));
        assert!(artifact.path.starts_with(dir.path().join("temp")));
        // Parent subtree per job id exists, file itself is the caller's
        assert!(artifact.path.parent().unwrap().is_dir());
    }

    #[test]
    fn release_is_idempotent_and_records_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let artifact = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();
        fs::write(&artifact.path, vec![0u8; 128]).unwrap();

        store.release(artifact.id, ReleaseOutcome::Discard).unwrap();
        let released = store.get(artifact.id).unwrap();
        assert_eq!(released.state, ArtifactState::Reclaimable);
        assert_eq!(released.size_bytes, 128);

        // Second release must not error or re-stat
        fs::write(&artifact.path, vec![0u8; 999]).unwrap();
        store.release(artifact.id, ReleaseOutcome::Discard).unwrap();
        assert_eq!(store.get(artifact.id).unwrap().size_bytes, 128);
    }

    #[test]
    fn release_unknown_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let err = store
            .release(Uuid::new_v4(), ReleaseOutcome::Discard)
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownArtifact(_)));
    }

    #[test]
    fn retained_log_outlives_its_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let job = Uuid::new_v4();
        let log = store.allocate(job, ArtifactKind::Log).unwrap();
        fs::write(&log.path, b"job done\n").unwrap();

        store.release(log.id, ReleaseOutcome::RetainAsLog).unwrap();
        let released = store.get(log.id).unwrap();
        assert_eq!(released.state, ArtifactState::Reclaimable);
        assert_eq!(released.job, None);
    }

    #[test]
    fn allocate_backpressures_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = test_policy();
        policy.temp_max_bytes = 100;
        let store = open_store(dir.path(), policy);

        let a = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();
        fs::write(&a.path, vec![0u8; 100]).unwrap();
        store.release(a.id, ReleaseOutcome::Discard).unwrap();

        let err = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap_err();
        assert!(matches!(err, StoreError::StoreFull { .. }));

        // Log allocation is unaffected by the temp cap
        assert!(store.allocate(Uuid::new_v4(), ArtifactKind::Log).is_ok());
    }

    #[test]
    fn allocate_counts_bytes_written_before_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = test_policy();
        policy.temp_max_bytes = 100;
        let store = open_store(dir.path(), policy);

        // Still active: a running job has written past the cap already
        let a = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();
        fs::write(&a.path, vec![0u8; 150]).unwrap();

        let err = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap_err();
        assert!(matches!(err, StoreError::StoreFull { used: 150, .. }));
        assert_eq!(store.usage(ArtifactKind::Temp).bytes, 150);
    }

    #[test]
    fn mark_orphaned_transitions_only_active_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let job = Uuid::new_v4();
        let active = store.allocate(job, ArtifactKind::Temp).unwrap();
        let released = store.allocate(job, ArtifactKind::Temp).unwrap();
        store.release(released.id, ReleaseOutcome::Discard).unwrap();

        let affected = store.mark_orphaned(job).unwrap();
        assert_eq!(affected, vec![active.id]);

        let orphan = store.get(active.id).unwrap();
        assert_eq!(orphan.state, ArtifactState::Orphaned);
        assert!(orphan.orphaned_at.is_some());
        // Reclaimable stays reclaimable: transitions never move backward
        assert_eq!(
            store.get(released.id).unwrap().state,
            ArtifactState::Reclaimable
        );
    }

    #[test]
    fn list_returns_snapshots_filtered_by_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let job = Uuid::new_v4();
        let a = store.allocate(job, ArtifactKind::Temp).unwrap();
        let b = store.allocate(job, ArtifactKind::Log).unwrap();
        store.release(b.id, ReleaseOutcome::RetainAsLog).unwrap();

        let active = store.list(&[ArtifactState::Active]);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let reclaimable = store.list(&[ArtifactState::Reclaimable]);
        assert_eq!(reclaimable.len(), 1);
        assert_eq!(reclaimable[0].id, b.id);
    }

    #[test]
    fn forget_drops_entry_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let a = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();
        store.forget(a.id).unwrap();
        assert!(store.get(a.id).is_none());
        store.forget(a.id).unwrap();
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();
        let id = {
            let store = open_store(dir.path(), test_policy());
            store.allocate(job, ArtifactKind::Temp).unwrap().id
        };

        let store = open_store(dir.path(), test_policy());
        let artifact = store.get(id).unwrap();
        assert_eq!(artifact.state, ArtifactState::Active);
        assert_eq!(artifact.job, Some(job));
    }

    #[test]
    fn adopt_untracked_registers_stray_files_as_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let tracked = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();
        fs::write(&tracked.path, b"tracked").unwrap();
        let stray = dir.path().join("temp").join("leftover.mp4");
        fs::write(&stray, b"crashed mid-write").unwrap();

        let adopted = store.adopt_untracked().unwrap();
        assert_eq!(adopted, 1);

        let orphans = store.list(&[ArtifactState::Orphaned]);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].path, stray);
        assert_eq!(orphans[0].job, None);
        // The tracked artifact keeps its state
        assert_eq!(store.get(tracked.id).unwrap().state, ArtifactState::Active);
    }

    #[test]
    fn adoption_skips_files_that_vanish_before_stat() {
        // The reaper renames files out from under a concurrent walk; the
        // stat of a vanished path must not abort the whole adoption.
        assert!(
            stat_for_adoption(Path::new("/nonexistent/vanished.tmp"))
                .unwrap()
                .is_none()
        );

        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());
        fs::write(dir.path().join("temp").join("stray.mp4"), b"x").unwrap();
        assert_eq!(store.adopt_untracked().unwrap(), 1);
    }

    #[test]
    fn persist_merges_entries_written_by_another_process() {
        let dir = tempfile::tempdir().unwrap();

        // Stale view loaded before the other process wrote anything
        let stale = open_store(dir.path(), test_policy());
        let fresh = open_store(dir.path(), test_policy());

        let theirs = fresh.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();
        // The stale view persists without ever having seen `theirs`
        let ours = stale.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();

        let reopened = open_store(dir.path(), test_policy());
        assert!(reopened.get(theirs.id).is_some(), "their entry must survive");
        assert!(reopened.get(ours.id).is_some());
    }

    #[test]
    fn persist_does_not_resurrect_forgotten_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), test_policy());

        let a = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();
        let b = store.allocate(Uuid::new_v4(), ArtifactKind::Temp).unwrap();
        store.forget(a.id).unwrap();
        // Any later persist re-reads the index; `a` must stay gone
        store.release(b.id, ReleaseOutcome::Discard).unwrap();

        let reopened = open_store(dir.path(), test_policy());
        assert!(reopened.get(a.id).is_none());
        assert!(reopened.get(b.id).is_some());
    }

    #[test]
    fn corrupt_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("temp")).unwrap();
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("artifacts.json"), b"{{{{garbage").unwrap();

        let store = ArtifactStore::open(
            dir.path().join("temp"),
            dir.path().join("logs"),
            dir.path().join("artifacts.json"),
            test_policy(),
        )
        .unwrap();
        assert!(store.list_all().is_empty());
    }
}
