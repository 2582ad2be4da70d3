use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::TARGET_SAMPLE_RATE;
use crate::stt::TranscriptionError;

/// Intermediate audio file; removed from disk when dropped
#[derive(Debug)]
pub struct ExtractedAudio {
    path: PathBuf,
}

impl ExtractedAudio {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExtractedAudio {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Turns a media file into audio the recognizers can decode
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Extracts the audio track. `progress` receives fractions in 0..=1 when the
    /// duration is known. Returns `Ok(None)` if `cancel` fired first.
    async fn extract(
        &self,
        source: &Path,
        duration_secs: Option<f64>,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Option<ExtractedAudio>, TranscriptionError>;
}

pub struct FfmpegExtractor {
    ffmpeg_path: PathBuf,
    work_dir: PathBuf,
}

impl FfmpegExtractor {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    fn output_path(&self) -> PathBuf {
        self.work_dir
            .join(format!("extracted_{}_{}.wav", std::process::id(), Uuid::new_v4()))
    }

    fn map_failure(stderr: &str) -> TranscriptionError {
        let lower = stderr.to_lowercase();
        let unreadable = [
            "invalid data found",
            "no such file",
            "does not contain any stream",
            "could not find codec",
            "moov atom not found",
        ];
        if unreadable.iter().any(|m| lower.contains(m)) {
            TranscriptionError::UnreadableMedia(last_line(stderr))
        } else {
            TranscriptionError::Generic(format!("Audio extraction failed: {}", last_line(stderr)))
        }
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Seconds of output written, from an ffmpeg `-progress` key/value line
pub(crate) fn parse_progress_line(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // both keys carry microseconds
        "out_time_us" | "out_time_ms" => value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|v| *v >= 0)
            .map(|us| us as f64 / 1_000_000.0),
        _ => None,
    }
}

#[async_trait]
impl AudioExtractor for FfmpegExtractor {
    async fn extract(
        &self,
        source: &Path,
        duration_secs: Option<f64>,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Option<ExtractedAudio>, TranscriptionError> {
        let output = ExtractedAudio::new(self.output_path());

        let mut command = Command::new(&self.ffmpeg_path);
        command
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(source)
            .arg("-vn")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(TARGET_SAMPLE_RATE.to_string())
            .arg("-c:a")
            .arg("pcm_s16le")
            .arg("-progress")
            .arg("pipe:1")
            .arg("-nostats")
            .arg(output.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("FFmpeg command: {:?}", command);

        let mut child = command.spawn().map_err(|e| {
            TranscriptionError::EngineUnavailable(format!(
                "Failed to start {}: {}",
                self.ffmpeg_path.display(),
                e
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscriptionError::Generic("Failed to capture ffmpeg stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscriptionError::Generic("Failed to capture ffmpeg stderr".into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Ok(None);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let (Some(done), Some(total)) = (parse_progress_line(&line), duration_secs) {
                            if total > 0.0 {
                                progress((done / total).clamp(0.0, 1.0));
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("FFmpeg progress read error: {}", e);
                        break;
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Ok(None);
            }
            status = child.wait() => status.map_err(|e| TranscriptionError::Generic(e.to_string()))?,
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            tracing::error!("FFmpeg extraction failed: {}", last_line(&stderr_text));
            return Err(Self::map_failure(&stderr_text));
        }

        progress(1.0);
        tracing::info!(
            "Extracted audio from {} to {}",
            source.display(),
            output.path().display()
        );
        Ok(Some(output))
    }
}
