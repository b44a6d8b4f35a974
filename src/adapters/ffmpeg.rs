//! ffmpeg transcoder for sub-clip extraction.
//!
//! Spawns the `ffmpeg` CLI once per clip. The child is killed if the timeout
//! fires, and any partial output file is removed before returning an error.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use super::Transcoder;

/// Sub-clip extraction errors
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Invalid clip range: start={start}, end={end}")]
    InvalidRange { start: f64, end: f64 },

    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcode timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transcode failed with exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

/// Transcoder backed by the ffmpeg CLI
pub struct FfmpegTranscoder {
    /// Path to the ffmpeg binary (default: "ffmpeg")
    binary_path: String,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self::with_binary_path("ffmpeg")
    }

    /// Create a transcoder with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Argument list for cutting `[start, end)` out of `source`.
    ///
    /// Seeks before the input for speed, re-encodes so the clip starts on
    /// the requested frame rather than the previous keyframe.
    fn build_args(source: &Path, start: f64, end: f64, dest: &Path) -> Vec<String> {
        vec![
            "-nostdin".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.3}", start),
            "-i".to_string(),
            source.display().to_string(),
            "-t".to_string(),
            format!("{:.3}", end - start),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "ultrafast".to_string(),
            "-crf".to_string(),
            "23".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-y".to_string(),
            dest.display().to_string(),
        ]
    }

    async fn run(
        &self,
        source: &Path,
        start: f64,
        end: f64,
        dest: &Path,
        limit: Duration,
    ) -> std::result::Result<(), TranscodeError> {
        let child = Command::new(&self.binary_path)
            .args(Self::build_args(source, start, end, dest))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                binary: self.binary_path.clone(),
                source,
            })?;

        // Dropping the wait future on timeout kills the child
        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| TranscodeError::Timeout(limit))?
            .map_err(|source| TranscodeError::Spawn {
                binary: self.binary_path.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    /// Check that ffmpeg is installed and runnable
    pub async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.binary_path)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to run {} -version", self.binary_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg health check failed: {}", stderr.trim());
        }

        Ok(())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn extract_subclip(
        &self,
        source: &Path,
        start: f64,
        end: f64,
        dest: &Path,
        limit: Duration,
    ) -> std::result::Result<(), TranscodeError> {
        if !(start >= 0.0 && end > start && end.is_finite()) {
            return Err(TranscodeError::InvalidRange { start, end });
        }

        let result = self.run(source, start, end, dest, limit).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }
}
