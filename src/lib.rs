//! Anileech backend - artifact lifecycle and health supervision
//!
//! The worker runs transcode jobs against an external ffmpeg process,
//! tracks every file it produces in a durable artifact index, reclaims
//! disk space through the reaper, and reports liveness/readiness over
//! HTTP for the container orchestrator.

pub mod api;
pub mod config;
pub mod jobs;
pub mod media;
pub mod services;
pub mod store;

use std::sync::Arc;

use crate::config::Config;
use crate::jobs::reaper::ReaperStatus;
use crate::services::tracker::JobTracker;
use crate::services::worker::TranscodePool;
use crate::store::ArtifactStore;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<ArtifactStore>,
    pub tracker: Arc<JobTracker>,
    pub reaper_status: Arc<ReaperStatus>,
    pub pool: Arc<TranscodePool>,
}
