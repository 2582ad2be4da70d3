use crate::stt::WordTiming;
use serde::{Deserialize, Serialize};

/// Maximum words in one caption before a new one is started
pub const MAX_WORDS_PER_SEGMENT: usize = 7;
/// Silence between words, in seconds, that starts a new caption
pub const MAX_WORD_GAP_SECS: f64 = 0.9;

/// One time-aligned subtitle line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<String>,
}

impl TranscriptSegment {
    pub fn from_tokens(start: f64, end: f64, tokens: Vec<String>) -> Self {
        Self {
            start,
            end: end.max(start),
            text: tokens.join(" "),
            tokens,
        }
    }

    /// Single segment covering `[0, max(duration, 1)]`, used when a recognizer
    /// returns text without usable word timings.
    pub fn spanning_media(text: &str, duration_secs: Option<f64>) -> Self {
        let end = duration_secs.unwrap_or(0.0).max(1.0);
        let tokens = text.split_whitespace().map(str::to_string).collect();
        Self::from_tokens(0.0, end, tokens)
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Groups chronologically sorted word timings into caption-sized segments
#[derive(Debug, Clone, Copy)]
pub struct SegmentBuilder {
    max_words: usize,
    max_gap_secs: f64,
}

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self {
            max_words: MAX_WORDS_PER_SEGMENT,
            max_gap_secs: MAX_WORD_GAP_SECS,
        }
    }
}

impl SegmentBuilder {
    pub fn new(max_words: usize, max_gap_secs: f64) -> Self {
        Self {
            max_words: max_words.max(1),
            max_gap_secs,
        }
    }

    pub fn build(&self, words: &[WordTiming]) -> Vec<TranscriptSegment> {
        let mut segments = Vec::new();
        let mut current = PendingSegment::default();

        for word in words {
            let text = word.text.trim();
            if text.is_empty() {
                continue;
            }

            let gap_exceeded = current
                .last_end
                .map(|end| word.start - end > self.max_gap_secs)
                .unwrap_or(false);

            if current.tokens.len() >= self.max_words || gap_exceeded {
                if let Some(segment) = current.take() {
                    segments.push(segment);
                }
            }

            current.push(text, word.start, word.end());
        }

        if let Some(segment) = current.take() {
            segments.push(segment);
        }

        segments
    }
}

/// Convenience wrapper with the default caption heuristics
pub fn build_segments(words: &[WordTiming]) -> Vec<TranscriptSegment> {
    SegmentBuilder::default().build(words)
}

#[derive(Default)]
struct PendingSegment {
    start: f64,
    last_end: Option<f64>,
    tokens: Vec<String>,
}

impl PendingSegment {
    fn push(&mut self, text: &str, start: f64, end: f64) {
        if self.tokens.is_empty() {
            self.start = start;
        }
        self.tokens.push(text.to_string());
        self.last_end = Some(self.last_end.map_or(end, |prev| prev.max(end)));
    }

    fn take(&mut self) -> Option<TranscriptSegment> {
        if self.tokens.is_empty() {
            return None;
        }
        let tokens = std::mem::take(&mut self.tokens);
        let end = self.last_end.take().unwrap_or(self.start);
        Some(TranscriptSegment::from_tokens(self.start, end, tokens))
    }
}
