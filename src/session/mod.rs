use crate::engine::RecognitionResult;
use crate::media::{MediaIdentity, MediaItem};
use crate::orchestrator::AttemptContext;
use crate::stt::{RecognitionMode, TranscriptionError};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub mod progress;
pub mod segment;
pub mod stitcher;
pub mod transcript;

pub use progress::{RecognitionProgress, RecognitionStage};
pub use segment::{build_segments, SegmentBuilder, TranscriptSegment};
pub use stitcher::WordStitcher;
pub use transcript::{segment_span, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    AwaitingFallbackConsent,
    Terminal(TerminalState),
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::AwaitingFallbackConsent => "awaiting fallback consent",
            SessionState::Terminal(TerminalState::Success) => "succeeded",
            SessionState::Terminal(TerminalState::Failure) => "failed",
        }
    }
}

/// What callers observe about one media item's transcription
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub media_id: MediaIdentity,
    pub generation: u64,
    pub state: SessionState,
    pub is_running: bool,
    pub progress: Option<RecognitionProgress>,
    pub error: Option<TranscriptionError>,
    pub fallback_reason: Option<String>,
    pub fallback_allowed: bool,
    pub result: Option<Transcript>,
}

/// Per-media job record. Only the coordinator mutates it.
pub struct Session {
    pub media: MediaItem,
    pub locale: String,
    pub generation: u64,
    pub state: SessionState,
    pub last_progress: Option<RecognitionProgress>,
    pub last_error: Option<TranscriptionError>,
    pub fallback_reason: Option<String>,
    pub fallback_allowed: bool,
    pub attempt: AttemptContext,
    /// On-device result held back while the user decides on server fallback
    pub pending_result: Option<RecognitionResult>,
    pub result: Option<Transcript>,
    cancel: CancellationToken,
    updates: watch::Sender<SessionSnapshot>,
}

impl Session {
    pub fn new(media: MediaItem, locale: impl Into<String>) -> Self {
        let initial = SessionSnapshot {
            media_id: media.id.clone(),
            generation: 0,
            state: SessionState::Idle,
            is_running: false,
            progress: None,
            error: None,
            fallback_reason: None,
            fallback_allowed: false,
            result: None,
        };
        let (updates, _) = watch::channel(initial);

        Self {
            media,
            locale: locale.into(),
            generation: 0,
            state: SessionState::Idle,
            last_progress: None,
            last_error: None,
            fallback_reason: None,
            fallback_allowed: false,
            attempt: AttemptContext::new(RecognitionMode::OnDevice),
            pending_result: None,
            result: None,
            cancel: CancellationToken::new(),
            updates,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Stops whatever runs under the current generation and opens a new one
    pub fn next_generation(&mut self) -> (u64, CancellationToken) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation += 1;
        (self.generation, self.cancel.clone())
    }

    /// Enters `Running` under a fresh generation
    pub fn begin_attempt(&mut self) -> (u64, CancellationToken) {
        let next = self.next_generation();
        self.state = SessionState::Running;
        self.last_error = None;
        self.fallback_reason = None;
        self.pending_result = None;
        self.last_progress = None;
        next
    }

    pub fn reset_to_idle(&mut self) {
        self.next_generation();
        self.state = SessionState::Idle;
        self.last_progress = None;
        self.last_error = None;
        self.fallback_reason = None;
        self.pending_result = None;
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Applies a progress event unless it would move the stage backwards
    pub fn apply_progress(&mut self, event: RecognitionProgress) -> bool {
        if let Some(last) = &self.last_progress {
            if event.stage < last.stage {
                return false;
            }
            if *last == event {
                return false;
            }
        }
        self.last_progress = Some(event);
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            media_id: self.media.id.clone(),
            generation: self.generation,
            state: self.state,
            is_running: self.is_running(),
            progress: self.last_progress.clone(),
            error: self.last_error.clone(),
            fallback_reason: self.fallback_reason.clone(),
            fallback_allowed: self.fallback_allowed,
            result: self.result.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    pub fn publish(&self) {
        self.updates.send_replace(self.snapshot());
    }
}
