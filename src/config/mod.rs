//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::store::RetentionPolicy;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Health/metrics server port
    pub port: u16,

    /// Transient working files root
    pub temp_dir: PathBuf,

    /// Append-only job log root
    pub logs_dir: PathBuf,

    /// Durable artifact index path (shared with the cleanup binary)
    pub index_path: PathBuf,

    /// Path to the ffmpeg binary
    pub ffmpeg_path: String,

    /// Hard timeout for a single ffmpeg invocation
    pub ffmpeg_timeout: Duration,

    /// Maximum concurrent transcode jobs
    pub max_concurrent_jobs: usize,

    /// Pending transcode request queue capacity
    pub queue_capacity: usize,

    /// Interval between reaper sweeps inside the worker
    pub sweep_interval: Duration,

    /// Maximum age of a released temp artifact before deletion
    pub temp_max_age: Duration,

    /// Maximum age of a job log before deletion
    pub log_max_age: Duration,

    /// Aggregate size cap for temp artifacts
    pub temp_max_bytes: u64,

    /// Aggregate size cap for log artifacts
    pub log_max_bytes: u64,

    /// Confirmation window before an orphaned artifact may be deleted
    pub orphan_grace: Duration,

    /// A running job older than this marks the worker not-ready
    pub stuck_job_threshold: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid PORT")?,

            temp_dir: PathBuf::from(env::var("TEMP_DIR").unwrap_or_else(|_| "./temp".to_string())),

            logs_dir: PathBuf::from(env::var("LOGS_DIR").unwrap_or_else(|_| "./logs".to_string())),

            index_path: PathBuf::from(
                env::var("INDEX_PATH").unwrap_or_else(|_| "./data/artifacts.json".to_string()),
            ),

            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),

            ffmpeg_timeout: duration_var("FFMPEG_TIMEOUT", 300)?,

            max_concurrent_jobs: env::var("MAX_CONCURRENT_DOWNLOADS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid MAX_CONCURRENT_DOWNLOADS")?,

            queue_capacity: env::var("QUEUE_CAPACITY")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid QUEUE_CAPACITY")?,

            sweep_interval: duration_var("SWEEP_INTERVAL_SECS", 300)?,

            temp_max_age: duration_var("TEMP_MAX_AGE_SECS", 3600)?,

            log_max_age: duration_var("LOG_MAX_AGE_SECS", 7 * 24 * 3600)?,

            temp_max_bytes: env::var("TEMP_MAX_BYTES")
                .unwrap_or_else(|_| (10u64 * 1024 * 1024 * 1024).to_string())
                .parse()
                .context("Invalid TEMP_MAX_BYTES")?,

            log_max_bytes: env::var("LOG_MAX_BYTES")
                .unwrap_or_else(|_| (1024u64 * 1024 * 1024).to_string())
                .parse()
                .context("Invalid LOG_MAX_BYTES")?,

            orphan_grace: duration_var("ORPHAN_GRACE_SECS", 600)?,

            stuck_job_threshold: duration_var("STUCK_JOB_SECS", 1800)?,
        })
    }

    /// Retention policy handed to the artifact store and the reaper
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            temp_max_age: self.temp_max_age,
            log_max_age: self.log_max_age,
            temp_max_bytes: self.temp_max_bytes,
            log_max_bytes: self.log_max_bytes,
            orphan_grace: self.orphan_grace,
        }
    }
}

/// Parse a duration-in-seconds environment variable with a default
fn duration_var(name: &str, default_secs: u64) -> Result<Duration> {
    let secs: u64 = env::var(name)
        .unwrap_or_else(|_| default_secs.to_string())
        .parse()
        .with_context(|| format!("Invalid {name}"))?;
    Ok(Duration::from_secs(secs))
}
