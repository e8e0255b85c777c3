//! Durable artifact index shared between the worker and cleanup processes
//!
//! The index is a single JSON file rewritten atomically on every change:
//! the new contents go to a sibling `.tmp` file which is then renamed over
//! the live path, so a crash mid-write never leaves a half-written index.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Artifact;

const INDEX_VERSION: u32 = 1;

/// On-disk representation of the artifact index
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    saved_at: DateTime<Utc>,
    artifacts: Vec<Artifact>,
}

/// Handle to the on-disk artifact index
#[derive(Debug, Clone)]
pub struct DiskIndex {
    path: PathBuf,
}

impl DiskIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the advisory cross-process lock guarding load-modify-save
    /// cycles on the index. Blocks until the other process finishes its
    /// cycle; the lock is released when the returned handle drops.
    pub fn lock(&self) -> io::Result<fs::File> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.with_extension("json.lock"))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    /// Load all artifact entries; a missing index file is an empty index
    pub fn load(&self) -> io::Result<Vec<Artifact>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let file: IndexFile = serde_json::from_slice(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        debug!(
            path = %self.path.display(),
            entries = file.artifacts.len(),
            "Loaded artifact index"
        );
        Ok(file.artifacts)
    }

    /// Atomically replace the index with the given snapshot
    pub fn save(&self, artifacts: &[Artifact]) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = IndexFile {
            version: INDEX_VERSION,
            saved_at: Utc::now(),
            artifacts: artifacts.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            entries = artifacts.len(),
            "Saved artifact index"
        );
        Ok(())
    }
}
