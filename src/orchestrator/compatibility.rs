use crate::media::{ContentSignature, MediaItem};
use crate::session::Transcript;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerances for accepting a transcript as belonging to a media file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityThresholds {
    /// How far the last segment may run past the media end
    pub end_tolerance_secs: f64,
    /// Span rules below only apply from this media length on
    pub strict_min_media_secs: f64,
    pub max_head_gap_secs: f64,
    pub max_head_gap_fraction: f64,
    pub max_tail_gap_secs: f64,
    pub min_coverage_fraction: f64,
}

impl Default for CompatibilityThresholds {
    fn default() -> Self {
        Self {
            end_tolerance_secs: 1.5,
            strict_min_media_secs: 60.0,
            max_head_gap_secs: 8.0,
            max_head_gap_fraction: 0.10,
            max_tail_gap_secs: 8.0,
            min_coverage_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Incompatibility {
    #[error("transcript was made for another media fingerprint")]
    FingerprintMismatch,

    #[error("media file changed since the transcript was made")]
    ContentChanged,

    #[error("transcript has no segments")]
    Empty,

    #[error("segments end at {end:.1}s, past the media duration of {duration:.1}s")]
    OverrunsMedia { end: f64, duration: f64 },

    #[error("speech starts at {start:.1}s, later than {allowed:.1}s into the media")]
    LateStart { start: f64, allowed: f64 },

    #[error("speech ends at {end:.1}s, more than {allowed:.1}s before the media ends")]
    EarlyEnd { end: f64, allowed: f64 },

    #[error("segments cover only {percent:.0}% of the media")]
    LowCoverage { percent: f64 },
}

impl Incompatibility {
    /// Failures of the timing heuristics, as opposed to the transcript belonging to other content
    pub fn is_span_rule(&self) -> bool {
        matches!(
            self,
            Incompatibility::LateStart { .. }
                | Incompatibility::EarlyEnd { .. }
                | Incompatibility::LowCoverage { .. }
        )
    }
}

impl CompatibilityThresholds {
    /// Decides whether `transcript` can be shown for `media` whose file currently has `signature`
    pub fn check(
        &self,
        transcript: &Transcript,
        media: &MediaItem,
        signature: &ContentSignature,
    ) -> Result<(), Incompatibility> {
        if transcript.media_fingerprint != media.fingerprint {
            return Err(Incompatibility::FingerprintMismatch);
        }
        if transcript.content_signature != *signature {
            return Err(Incompatibility::ContentChanged);
        }

        let (min_start, max_end) = transcript.span().ok_or(Incompatibility::Empty)?;
        let Some(duration) = media.duration_secs else {
            return Ok(());
        };

        if max_end > duration + self.end_tolerance_secs {
            return Err(Incompatibility::OverrunsMedia {
                end: max_end,
                duration,
            });
        }

        if duration < self.strict_min_media_secs {
            return Ok(());
        }

        let allowed_head = self
            .max_head_gap_secs
            .min(duration * self.max_head_gap_fraction);
        if min_start > allowed_head {
            return Err(Incompatibility::LateStart {
                start: min_start,
                allowed: allowed_head,
            });
        }

        if duration - max_end > self.max_tail_gap_secs {
            return Err(Incompatibility::EarlyEnd {
                end: max_end,
                allowed: self.max_tail_gap_secs,
            });
        }

        let coverage = (max_end - min_start).max(0.0) / duration;
        if coverage < self.min_coverage_fraction {
            return Err(Incompatibility::LowCoverage {
                percent: coverage * 100.0,
            });
        }

        Ok(())
    }
}
