// src/stt/whisper.rs
// Whisper.cpp on-device recognizer

use super::{
    language_code, RecognitionMode, RecognitionRequest, RecognitionSink, SpeechRecognizer,
    TranscriptionError, WordTiming,
};
use async_trait::async_trait;
use regex::Regex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::{env, fs};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub struct WhisperCppRecognizer {
    bin_path: PathBuf,
    model_path: PathBuf,
    threads: Option<u16>,
}

impl WhisperCppRecognizer {
    /// Resolves the binary and model from explicit paths, then `WHISPER_CPP_BIN` /
    /// `WHISPER_MODEL`, then well-known local locations.
    pub fn locate(bin: Option<PathBuf>, model: Option<PathBuf>) -> Option<Self> {
        let bin_path = bin
            .or_else(|| env::var("WHISPER_CPP_BIN").ok().map(PathBuf::from))
            .or_else(default_whisper_bin);

        let model_path = model
            .or_else(|| env::var("WHISPER_MODEL").ok().map(PathBuf::from))
            .or_else(default_whisper_model);

        let bin_path = match bin_path {
            Some(p) if p.exists() => p,
            Some(p) => {
                tracing::warn!("Whisper bin not found at {}", p.display());
                return None;
            }
            None => {
                tracing::warn!("Whisper bin not configured. Set WHISPER_CPP_BIN.");
                return None;
            }
        };

        let model_path = match model_path {
            Some(p) if p.exists() => p,
            Some(p) => {
                tracing::warn!("Whisper model not found at {}", p.display());
                return None;
            }
            None => {
                tracing::warn!("Whisper model not configured. Set WHISPER_MODEL.");
                return None;
            }
        };

        tracing::info!(
            "Whisper recognizer initialized: bin={}, model={}",
            bin_path.display(),
            model_path.display()
        );

        Some(Self::new(bin_path, model_path))
    }

    pub fn new(bin_path: PathBuf, model_path: PathBuf) -> Self {
        Self {
            bin_path,
            model_path,
            threads: None,
        }
    }

    pub fn with_threads(mut self, threads: u16) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    fn is_english_only_model(&self) -> bool {
        self.model_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(".en."))
            .unwrap_or(false)
    }

    fn build_command(&self, request: &RecognitionRequest) -> Command {
        let language = request.language();
        let mut command = Command::new(&self.bin_path);
        command
            .arg("--model")
            .arg(&self.model_path)
            .arg("--file")
            .arg(&request.audio_path)
            .arg("--language")
            .arg(if language.is_empty() { "auto" } else { language.as_str() })
            // one word per output line
            .arg("--max-len")
            .arg("1")
            .arg("--split-on-word")
            .arg("--no-prints");
        if let Some(threads) = self.threads {
            command.arg("--threads").arg(threads.to_string());
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn map_failure(stderr: &str) -> TranscriptionError {
        let lower = stderr.to_lowercase();
        if lower.contains("failed to open") || lower.contains("failed to read") {
            TranscriptionError::UnreadableMedia(stderr.trim().to_string())
        } else if lower.contains("failed to initialize") || lower.contains("failed to load model") {
            TranscriptionError::EngineUnavailable(stderr.trim().to_string())
        } else {
            TranscriptionError::Generic(format!("Whisper failed: {}", stderr.trim()))
        }
    }
}

/// Parses a `[00:00:01.230 --> 00:00:01.560]  word` output line
pub(crate) fn parse_timed_line(line: &str) -> Option<WordTiming> {
    static LINE_RE: OnceLock<Regex> = OnceLock::new();
    let re = LINE_RE.get_or_init(|| {
        Regex::new(
            r"^\s*\[(\d+):(\d{2}):(\d{2})[.,](\d{3}) --> (\d+):(\d{2}):(\d{2})[.,](\d{3})\]\s*(.*)$",
        )
        .expect("valid whisper line regex")
    });

    let caps = re.captures(line)?;
    let secs = |h: usize| -> Option<f64> {
        let hours: f64 = caps.get(h)?.as_str().parse().ok()?;
        let minutes: f64 = caps.get(h + 1)?.as_str().parse().ok()?;
        let seconds: f64 = caps.get(h + 2)?.as_str().parse().ok()?;
        let millis: f64 = caps.get(h + 3)?.as_str().parse().ok()?;
        Some(hours * 3600.0 + minutes * 60.0 + seconds + millis / 1000.0)
    };

    let start = secs(1)?;
    let end = secs(5)?;
    let text = caps.get(9)?.as_str().trim();
    if text.is_empty() {
        return None;
    }
    Some(WordTiming::new(text, start, (end - start).max(0.0)))
}

#[async_trait]
impl SpeechRecognizer for WhisperCppRecognizer {
    fn name(&self) -> &str {
        "Whisper.cpp"
    }

    fn mode(&self) -> RecognitionMode {
        RecognitionMode::OnDevice
    }

    fn supports_locale(&self, locale: &str) -> bool {
        !self.is_english_only_model() || language_code(locale) == "en"
    }

    async fn recognize(
        &self,
        request: RecognitionRequest,
        sink: RecognitionSink,
        stop: CancellationToken,
    ) -> Result<(), TranscriptionError> {
        let mut child = self.build_command(&request).spawn().map_err(|e| {
            TranscriptionError::EngineUnavailable(format!(
                "Failed to start {}: {}",
                self.bin_path.display(),
                e
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscriptionError::Generic("Failed to capture whisper stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscriptionError::Generic("Failed to capture whisper stderr".into()))?;

        // Drain stderr concurrently so a chatty process never blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut words: Vec<WordTiming> = Vec::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    tracing::debug!("Whisper STT: stopping child process");
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Ok(());
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(word) = parse_timed_line(&line) {
                                words.push(word.clone());
                                sink.partial(vec![word]);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("Whisper STT: stdout read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = stop.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Ok(());
            }
            status = child.wait() => status
                .map_err(|e| TranscriptionError::Generic(e.to_string()))?,
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            tracing::warn!("Whisper STT exited with {}", status);
            return Err(Self::map_failure(&stderr_text));
        }

        let text = words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        tracing::info!("Whisper STT success: {} words", words.len());
        sink.finish(words, text);
        Ok(())
    }
}

fn default_whisper_bin() -> Option<PathBuf> {
    let candidates = [
        "bin/whisper-cli.exe",
        "bin/whisper-cli",
        "bin/main.exe",
        "bin/main",
    ];

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn default_whisper_model() -> Option<PathBuf> {
    let candidates = [
        "models/ggml-base.bin",
        "models/ggml-small.bin",
        "models/ggml-base.en.bin",
        "models/ggml-small.en.bin",
    ];

    if let Some(path) = candidates.iter().map(PathBuf::from).find(|p| p.exists()) {
        return Some(path);
    }

    // Fallback: any ggml-*.bin in models/
    let dir = Path::new("models");
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension() == Some(OsStr::new("bin")) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("ggml-") {
                    return Some(path);
                }
            }
        }
    }

    None
}
