// src/stt/mod.rs
// Speech recognition backends

mod groq;
mod types;
mod whisper;

pub use groq::GroqRecognizer;
pub use types::{RecognitionMode, TranscriptionError, WordTiming};
pub use whisper::WhisperCppRecognizer;

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Parameters for one recognizer invocation
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    /// Decodable audio file (already extracted when the source was a video)
    pub audio_path: PathBuf,
    /// BCP-47 style locale, e.g. "en-US"
    pub locale: String,
    /// Estimated media duration in seconds, if known
    pub duration_secs: Option<f64>,
}

impl RecognitionRequest {
    /// Primary language subtag ("en-US" -> "en")
    pub fn language(&self) -> String {
        language_code(&self.locale)
    }
}

pub fn language_code(locale: &str) -> String {
    locale
        .split(|c| c == '-' || c == '_')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Signals a recognizer delivers while it runs
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    /// Word timings observed so far; may overlap or repeat earlier partials
    Partial(Vec<WordTiming>),
    /// Final result with the complete word list and the raw transcript text
    Final { words: Vec<WordTiming>, text: String },
    Failed(TranscriptionError),
}

/// Sending half handed to recognizers. Delivery after the attempt resolved is ignored.
#[derive(Debug, Clone)]
pub struct RecognitionSink {
    tx: mpsc::UnboundedSender<RecognizerEvent>,
}

impl RecognitionSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RecognizerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn partial(&self, words: Vec<WordTiming>) {
        let _ = self.tx.send(RecognizerEvent::Partial(words));
    }

    pub fn finish(&self, words: Vec<WordTiming>, text: impl Into<String>) {
        let _ = self.tx.send(RecognizerEvent::Final {
            words,
            text: text.into(),
        });
    }

    pub fn fail(&self, error: TranscriptionError) {
        let _ = self.tx.send(RecognizerEvent::Failed(error));
    }
}

/// Unified recognizer trait
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Recognizer name used in logs, metrics and stored transcripts
    fn name(&self) -> &str;

    fn mode(&self) -> RecognitionMode;

    fn supports_locale(&self, _locale: &str) -> bool {
        true
    }

    /// Checks that the app may use this recognizer at all
    async fn authorize(&self) -> Result<(), TranscriptionError> {
        Ok(())
    }

    /// Runs recognition, reporting partials and the final result through `sink`.
    ///
    /// Implementations must return promptly once `stop` is cancelled. An `Err`
    /// return is forwarded to the sink as a failure.
    async fn recognize(
        &self,
        request: RecognitionRequest,
        sink: RecognitionSink,
        stop: CancellationToken,
    ) -> Result<(), TranscriptionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_code_takes_primary_subtag() {
        assert_eq!(language_code("en-US"), "en");
        assert_eq!(language_code("pt_BR"), "pt");
        assert_eq!(language_code("JA"), "ja");
        assert_eq!(language_code(""), "");
    }

    #[tokio::test]
    async fn sink_delivers_in_order() {
        let (sink, mut rx) = RecognitionSink::channel();
        sink.partial(vec![WordTiming::new("a", 0.0, 0.2)]);
        sink.fail(TranscriptionError::Timeout);

        assert!(matches!(rx.recv().await, Some(RecognizerEvent::Partial(_))));
        assert!(matches!(
            rx.recv().await,
            Some(RecognizerEvent::Failed(TranscriptionError::Timeout))
        ));
    }
}
