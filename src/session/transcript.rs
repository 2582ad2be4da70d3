use crate::media::ContentSignature;
use crate::stt::RecognitionMode;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::TranscriptSegment;

/// A finished transcript as handed to the cache and published to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub media_fingerprint: String,
    pub content_signature: ContentSignature,
    pub locale: String,
    /// Recognizer name that produced the segments
    pub recognizer: String,
    pub mode: RecognitionMode,
    pub segments: Vec<TranscriptSegment>,
    /// RFC 3339 creation time
    pub created_at: String,
}

impl Transcript {
    pub fn new(
        media_fingerprint: impl Into<String>,
        content_signature: ContentSignature,
        locale: impl Into<String>,
        recognizer: impl Into<String>,
        mode: RecognitionMode,
        segments: Vec<TranscriptSegment>,
    ) -> Self {
        Self {
            media_fingerprint: media_fingerprint.into(),
            content_signature,
            locale: locale.into(),
            recognizer: recognizer.into(),
            mode,
            segments,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    /// `(min start, max end)` over all segments
    pub fn span(&self) -> Option<(f64, f64)> {
        segment_span(&self.segments)
    }

    pub fn full_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn word_count(&self) -> usize {
        self.segments.iter().map(|s| s.tokens.len()).sum()
    }
}

pub fn segment_span(segments: &[TranscriptSegment]) -> Option<(f64, f64)> {
    let min_start = segments.iter().map(|s| s.start).reduce(f64::min)?;
    let max_end = segments.iter().map(|s| s.end).reduce(f64::max)?;
    Some((min_start, max_end))
}
