// src/stt/groq.rs
// Groq Whisper server recognizer

use super::{
    RecognitionMode, RecognitionRequest, RecognitionSink, SpeechRecognizer, TranscriptionError,
    WordTiming,
};
use async_trait::async_trait;
use regex::Regex;
use reqwest::multipart;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const DEFAULT_MODEL: &str = "whisper-large-v3";
const RESPONSE_FORMAT: &str = "verbose_json";
/// Upload limit of the transcription endpoint
const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;
/// Upper bound for the HTTP round trip; the engine timeout usually fires first
const TIMEOUT_SECS: u64 = 900;

pub struct GroqRecognizer {
    api_key: String,
    model: String,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    words: Vec<VerboseWord>,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Debug, Deserialize)]
struct VerboseWord {
    word: String,
    start: f64,
    end: f64,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
}

impl GroqRecognizer {
    pub fn new(api_key: String, model: Option<String>) -> Result<Self, TranscriptionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .map_err(|e| TranscriptionError::EngineUnavailable(e.to_string()))?;

        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        tracing::info!("Groq recognizer initialized: model={}", model);

        Ok(Self {
            api_key,
            model,
            endpoint: GROQ_API_URL.to_string(),
            client,
        })
    }

    /// Points the recognizer at another OpenAI-compatible endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn clean_word(text: &str) -> String {
        static TS_RE: OnceLock<Regex> = OnceLock::new();
        let re = TS_RE.get_or_init(|| {
            Regex::new(r"\[\d{2}:\d{2}.*?\]|\(\d{2}:\d{2}\)").expect("valid timestamp regex")
        });
        re.replace_all(text, "").trim().to_string()
    }

    fn mime_for(path: &Path) -> &'static str {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("mp3") => "audio/mpeg",
            Some("flac") => "audio/flac",
            Some("ogg") | Some("opus") => "audio/ogg",
            Some("m4a") => "audio/mp4",
            _ => "audio/wav",
        }
    }

    /// Word timings from a verbose response. Falls back to segment-level timing
    /// spread evenly over the words when word granularity is missing.
    fn words_from_response(response: &VerboseTranscription) -> Vec<WordTiming> {
        if !response.words.is_empty() {
            return response
                .words
                .iter()
                .map(|w| {
                    WordTiming::new(Self::clean_word(&w.word), w.start, (w.end - w.start).max(0.0))
                })
                .filter(|w| !w.text.is_empty())
                .collect();
        }

        let mut words = Vec::new();
        for segment in &response.segments {
            let tokens: Vec<String> = segment
                .text
                .split_whitespace()
                .map(Self::clean_word)
                .filter(|t| !t.is_empty())
                .collect();
            if tokens.is_empty() {
                continue;
            }
            let span = (segment.end - segment.start).max(0.0);
            let step = span / tokens.len() as f64;
            for (idx, token) in tokens.into_iter().enumerate() {
                words.push(WordTiming::new(token, segment.start + step * idx as f64, step));
            }
        }
        words
    }

    fn map_status(status: reqwest::StatusCode, body: &str) -> TranscriptionError {
        match status.as_u16() {
            401 | 403 => TranscriptionError::AuthorizationDenied,
            429 => TranscriptionError::EngineUnavailable("rate limit exceeded".to_string()),
            400 if body.to_lowercase().contains("file") => {
                TranscriptionError::UnreadableMedia(body.trim().to_string())
            }
            code if code >= 500 => {
                TranscriptionError::EngineUnavailable(format!("HTTP {}", status))
            }
            _ => TranscriptionError::Generic(format!("HTTP {}: {}", status, body.trim())),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for GroqRecognizer {
    fn name(&self) -> &str {
        "Groq Whisper"
    }

    fn mode(&self) -> RecognitionMode {
        RecognitionMode::Server
    }

    async fn authorize(&self) -> Result<(), TranscriptionError> {
        if self.api_key.trim().is_empty() {
            return Err(TranscriptionError::AuthorizationDenied);
        }
        Ok(())
    }

    async fn recognize(
        &self,
        request: RecognitionRequest,
        sink: RecognitionSink,
        stop: CancellationToken,
    ) -> Result<(), TranscriptionError> {
        let metadata = tokio::fs::metadata(&request.audio_path)
            .await
            .map_err(|e| TranscriptionError::UnreadableMedia(e.to_string()))?;
        if metadata.len() > MAX_UPLOAD_BYTES {
            return Err(TranscriptionError::Generic(format!(
                "Audio is too large for server recognition ({} MB)",
                metadata.len() / (1024 * 1024)
            )));
        }

        let bytes = tokio::fs::read(&request.audio_path)
            .await
            .map_err(|e| TranscriptionError::UnreadableMedia(e.to_string()))?;

        let file_name = request
            .audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        tracing::info!(
            "Groq STT: uploading {} ({} bytes, language={})",
            file_name,
            bytes.len(),
            request.language()
        );

        let file_part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(Self::mime_for(&request.audio_path))
            .map_err(|e| TranscriptionError::Generic(e.to_string()))?;

        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", RESPONSE_FORMAT)
            .text("timestamp_granularities[]", "word")
            .part("file", file_part);
        let language = request.language();
        if !language.is_empty() {
            form = form.text("language", language);
        }

        let send = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send();

        let response = tokio::select! {
            _ = stop.cancelled() => {
                tracing::debug!("Groq STT: request abandoned");
                return Ok(());
            }
            response = send => response,
        };

        let resp = match response {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(TranscriptionError::Timeout),
            Err(e) => return Err(TranscriptionError::EngineUnavailable(e.to_string())),
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!("Groq STT failed: HTTP {}", status);
            return Err(Self::map_status(status, &body));
        }

        let parsed: VerboseTranscription = resp
            .json()
            .await
            .map_err(|e| TranscriptionError::Generic(format!("Malformed response: {}", e)))?;

        let words = Self::words_from_response(&parsed);
        let text = parsed.text.split_whitespace().collect::<Vec<_>>().join(" ");

        tracing::info!(
            "Groq STT success: {} words, {} chars",
            words.len(),
            text.len()
        );

        sink.finish(words, text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_word_granularity() {
        let json = r#"{
            "text": " Hola mundo",
            "words": [
                {"word": "Hola", "start": 0.0, "end": 0.4},
                {"word": " mundo", "start": 0.5, "end": 1.0}
            ]
        }"#;
        let parsed: VerboseTranscription = serde_json::from_str(json).unwrap();
        let words = GroqRecognizer::words_from_response(&parsed);

        assert_eq!(words.len(), 2);
        assert_eq!(words[1].text, "mundo");
        assert!((words[1].duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn spreads_segments_when_words_missing() {
        let json = r#"{
            "text": "uno dos",
            "segments": [{"start": 2.0, "end": 3.0, "text": " uno dos"}]
        }"#;
        let parsed: VerboseTranscription = serde_json::from_str(json).unwrap();
        let words = GroqRecognizer::words_from_response(&parsed);

        assert_eq!(words.len(), 2);
        assert!((words[0].start - 2.0).abs() < 1e-9);
        assert!((words[1].start - 2.5).abs() < 1e-9);
    }

    #[test]
    fn maps_http_statuses() {
        use reqwest::StatusCode;

        assert_eq!(
            GroqRecognizer::map_status(StatusCode::UNAUTHORIZED, ""),
            TranscriptionError::AuthorizationDenied
        );
        assert!(GroqRecognizer::map_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(GroqRecognizer::map_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            GroqRecognizer::map_status(StatusCode::BAD_REQUEST, "could not process file"),
            TranscriptionError::UnreadableMedia(_)
        ));
    }
}
