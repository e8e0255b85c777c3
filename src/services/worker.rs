//! Bounded transcode worker pool
//!
//! Workers pull requests off a shared queue, register the job with the
//! tracker, allocate its artifacts, shell out to ffmpeg, and always end
//! the job - success, failure or timeout - so no artifact is ever left
//! `active` behind a dead job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::tracker::{JobOutcome, JobTracker};
use crate::media::transcoder::Transcoder;
use crate::store::{Artifact, ArtifactKind, ArtifactStore};

/// One unit of work: transcode a single episode
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub job_id: Uuid,
    /// Input path or stream URL handed to ffmpeg
    pub input: String,
    /// Human-readable label for logs ("Title Ep 3")
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_concurrent: usize,
    pub queue_capacity: usize,
}

/// Errors from submitting work to the pool
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Backpressure: the caller retries later or rejects new work
    #[error("transcode queue is full")]
    QueueFull,

    #[error("worker pool is shut down")]
    Closed,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the running worker pool
pub struct TranscodePool {
    tx: mpsc::Sender<TranscodeRequest>,
    queue_capacity: usize,
    counters: Arc<Counters>,
}

impl TranscodePool {
    /// Spawn the worker tasks and return the submission handle
    pub fn start(
        config: WorkerPoolConfig,
        tracker: Arc<JobTracker>,
        store: Arc<ArtifactStore>,
        transcoder: Arc<Transcoder>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = config.max_concurrent.max(1);
        for i in 0..workers {
            tokio::spawn(worker_loop(
                format!("worker-{i}"),
                rx.clone(),
                tracker.clone(),
                store.clone(),
                transcoder.clone(),
                counters.clone(),
            ));
        }
        info!(workers, "Started transcode workers");

        Self {
            tx,
            queue_capacity: config.queue_capacity.max(1),
            counters,
        }
    }

    /// Enqueue a request without blocking; full queue is backpressure
    pub fn submit(&self, request: TranscodeRequest) -> Result<(), SubmitError> {
        self.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::QueueFull,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_capacity - self.tx.capacity()
    }

    pub fn processed(&self) -> u64 {
        self.counters.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

async fn worker_loop(
    name: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TranscodeRequest>>>,
    tracker: Arc<JobTracker>,
    store: Arc<ArtifactStore>,
    transcoder: Arc<Transcoder>,
    counters: Arc<Counters>,
) {
    loop {
        let request = { rx.lock().await.recv().await };
        let Some(request) = request else {
            // Channel closed: pool handle dropped
            break;
        };

        info!(worker = %name, job = %request.job_id, title = %request.title, "Processing request");
        match process(&request, &tracker, &store, &transcoder).await {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(worker = %name, job = %request.job_id, error = %e, "Request failed");
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Run one request under the tracker. Whatever happens after `begin`, the
/// job is ended exactly once and its artifacts are released.
async fn process(
    request: &TranscodeRequest,
    tracker: &JobTracker,
    store: &ArtifactStore,
    transcoder: &Transcoder,
) -> Result<()> {
    let job = request.job_id;
    tracker.begin(job)?;

    let result = run_job(request, tracker, store, transcoder).await;

    let outcome = match &result {
        Ok(()) => JobOutcome::Succeeded,
        Err(e) => {
            warn!(job = %job, error = %e, "Transcode failed");
            JobOutcome::Failed
        }
    };
    tracker.end(job, outcome)?;
    result
}

async fn run_job(
    request: &TranscodeRequest,
    tracker: &JobTracker,
    store: &ArtifactStore,
    transcoder: &Transcoder,
) -> Result<()> {
    let job = request.job_id;

    // StoreFull propagates: the pool counts a failure and the health
    // endpoint is already reporting not-ready.
    let output = store.allocate(job, ArtifactKind::Temp)?;
    tracker.attach(job, output.id)?;
    let log = store.allocate(job, ArtifactKind::Log)?;
    tracker.attach(job, log.id)?;

    append_log(
        &log,
        &format!("start: {} input={}", request.title, request.input),
    )
    .await?;

    let result = transcoder.run(&request.input, &output.path).await;
    let line = match &result {
        Ok(()) => format!("finished: {}", request.title),
        Err(e) => format!("failed: {}: {e}", request.title),
    };
    append_log(&log, &line).await?;

    result.with_context(|| format!("transcode of {} failed", request.title))
}

async fn append_log(log: &Artifact, line: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log.path)
        .await
        .with_context(|| format!("failed to open job log {}", log.path.display()))?;
    file.write_all(format!("{} {line}\n", chrono::Utc::now().to_rfc3339()).as_bytes())
        .await?;
    Ok(())
}
