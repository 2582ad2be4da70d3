// src/lib.rs
// Transcription pipeline coordinator: media file in, time-aligned subtitle segments out

pub mod audio;
pub mod cache;
pub mod config;
pub mod engine;
pub mod media;
pub mod orchestrator;
pub mod session;
pub mod stt;

pub use cache::{CacheError, JsonFileCache, MemoryCache, TranscriptCache};
pub use config::{AppConfig, ConfigError};
pub use engine::{AttemptRequest, RecognitionEngine, RecognitionResult, TranscriptionOutcome};
pub use media::{ContentSignature, MediaIdentity, MediaItem};
pub use orchestrator::{CoordinatorError, RecognizerSet, TranscriptionCoordinator};
pub use session::{
    RecognitionProgress, RecognitionStage, SessionSnapshot, SessionState, TerminalState,
    Transcript, TranscriptSegment,
};
pub use stt::{RecognitionMode, SpeechRecognizer, TranscriptionError, WordTiming};
