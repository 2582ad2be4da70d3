// src/stt/types.rs
// Recognition types and error definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One recognized word with its timing, in seconds from media start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub text: String,
    pub start: f64,
    pub duration: f64,
}

impl WordTiming {
    pub fn new(text: impl Into<String>, start: f64, duration: f64) -> Self {
        Self {
            text: text.into(),
            start,
            duration: duration.max(0.0),
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Millisecond key used to deduplicate repeated partial results
    pub fn dedup_key(&self) -> (i64, i64) {
        (
            (self.start * 1000.0).round() as i64,
            (self.duration * 1000.0).round() as i64,
        )
    }
}

/// Where a recognition attempt runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    OnDevice,
    Server,
}

impl fmt::Display for RecognitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionMode::OnDevice => f.write_str("on-device"),
            RecognitionMode::Server => f.write_str("server"),
        }
    }
}

/// Transcription error taxonomy shared by recognizers, the engine and the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TranscriptionError {
    #[error("Speech recognition permission was denied")]
    AuthorizationDenied,

    #[error("Speech recognition engine is unavailable: {0}")]
    EngineUnavailable(String),

    #[error("No speech detected")]
    NoSpeechDetected,

    #[error("Media could not be opened: {0}")]
    UnreadableMedia(String),

    #[error("Recognition timed out")]
    Timeout,

    #[error("Server recognition required: {0}")]
    FallbackRequired(String),

    #[error("{0}")]
    Generic(String),
}

impl TranscriptionError {
    /// Returns true if this error is worth one automatic retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TranscriptionError::NoSpeechDetected | TranscriptionError::EngineUnavailable(_)
        )
    }

    /// Heuristic over the message text for errors that actually mean the file is broken
    pub fn indicates_unreadable_file(&self) -> bool {
        if matches!(self, TranscriptionError::UnreadableMedia(_)) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        UNREADABLE_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

const UNREADABLE_MARKERS: &[&str] = &[
    "could not open",
    "couldn't open",
    "cannot open",
    "failed to open",
    "corrupt",
    "invalid data",
    "unreadable",
];
