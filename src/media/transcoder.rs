//! FFmpeg invocation with graceful termination
//!
//! The transcoder is an opaque external process: given an input (file path
//! or stream URL) and an output path it either succeeds, or fails with a
//! non-zero exit / timeout. On timeout ffmpeg is asked to quit by writing
//! `q` to its stdin so it can finalize the container, and only killed if
//! it does not comply.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Errors from one transcoder invocation
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to spawn {binary}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcode timed out after {0:?}")]
    Timeout(Duration),

    #[error("ffmpeg exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("transcoder I/O failed")]
    Io(#[from] std::io::Error),
}

/// Handle to the external ffmpeg binary
pub struct Transcoder {
    ffmpeg_path: String,
    timeout: Duration,
    quit_grace: Duration,
}

impl Transcoder {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
            quit_grace: Duration::from_secs(5),
        }
    }

    /// How long to wait for ffmpeg to quit gracefully before killing it
    pub fn with_quit_grace(mut self, grace: Duration) -> Self {
        self.quit_grace = grace;
        self
    }

    /// Remux `input` into a fragmented mp4 at `output`.
    ///
    /// Either the output file exists on return, or the invocation failed
    /// and the caller releases the output artifact.
    pub async fn run(&self, input: &str, output: &Path) -> Result<(), TranscodeError> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.arg("-y")
            .args(["-i", input])
            .args(["-c", "copy"])
            .args(["-f", "mp4"])
            .args(["-movflags", "frag_keyframe+empty_moov+default_base_moof"])
            .args(["-loglevel", "error"])
            .args(["-flush_packets", "1"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(input = %input, output = %output.display(), "Starting ffmpeg");

        let mut child = cmd.spawn().map_err(|source| TranscodeError::Spawn {
            binary: self.ffmpeg_path.clone(),
            source,
        })?;

        // Drain stderr concurrently so a chatty ffmpeg cannot fill the pipe
        // and deadlock against wait()
        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(input = %input, "ffmpeg exceeded timeout, terminating");
                self.terminate_gracefully(&mut child).await;
                return Err(TranscodeError::Timeout(self.timeout));
            }
        };

        if status.success() {
            debug!(output = %output.display(), "ffmpeg finished");
            Ok(())
        } else {
            let stderr = stderr_task.await.unwrap_or_default();
            Err(TranscodeError::Failed {
                code: status.code(),
                stderr: stderr.chars().take(500).collect(),
            })
        }
    }

    /// Ask ffmpeg to quit via stdin, then escalate to kill
    async fn terminate_gracefully(&self, child: &mut Child) {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }

        if tokio::time::timeout(self.quit_grace, child.wait())
            .await
            .is_err()
        {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let t = Transcoder::new("/nonexistent/ffmpeg", Duration::from_secs(5));
        let err = t
            .run("input.m3u8", Path::new("/tmp/out.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        // `false` ignores the ffmpeg arguments and exits 1
        let t = Transcoder::new("false", Duration::from_secs(5));
        let err = t
            .run("input.m3u8", Path::new("/tmp/out.mp4"))
            .await
            .unwrap_err();
        match err {
            TranscodeError::Failed { code, .. } => assert_eq!(code, Some(1)),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let t = Transcoder::new("true", Duration::from_secs(5));
        t.run("input.m3u8", Path::new("/tmp/out.mp4"))
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_process_times_out_and_is_killed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let t = Transcoder::new(script.to_string_lossy(), Duration::from_millis(100))
            .with_quit_grace(Duration::from_millis(100));
        let start = std::time::Instant::now();
        let err = t
            .run("input.m3u8", Path::new("/tmp/out.mp4"))
            .await
            .unwrap_err();

        assert!(matches!(err, TranscodeError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
