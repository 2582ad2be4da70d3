use crate::session::{segment_span, TranscriptSegment};
use crate::stt::{RecognitionMode, TranscriptionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u8,
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay_ms: 1000,
        }
    }
}

/// When an on-device result counts as incomplete. Empirical values, tune per recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageThresholds {
    /// Media at or below this length is never judged incomplete
    pub min_media_secs: f64,
    pub max_tail_gap_secs: f64,
    pub max_head_gap_secs: f64,
    pub max_head_gap_fraction: f64,
    pub min_coverage_fraction: f64,
}

impl Default for CoverageThresholds {
    fn default() -> Self {
        Self {
            min_media_secs: 30.0,
            max_tail_gap_secs: 8.0,
            max_head_gap_secs: 8.0,
            max_head_gap_fraction: 0.10,
            min_coverage_fraction: 0.5,
        }
    }
}

/// One coverage rule an on-device result violated
#[derive(Debug, Clone, PartialEq)]
pub enum CoverageGap {
    TailGap { end: f64, duration: f64 },
    HeadGap { start: f64, allowed: f64 },
    LowCoverage { covered_fraction: f64 },
}

impl fmt::Display for CoverageGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageGap::TailGap { end, duration } => write!(
                f,
                "recognized speech stops at {:.1}s, {:.1}s before the end of the media",
                end,
                duration - end
            ),
            CoverageGap::HeadGap { start, allowed } => write!(
                f,
                "recognized speech starts at {:.1}s (allowed {:.1}s)",
                start, allowed
            ),
            CoverageGap::LowCoverage { covered_fraction } => write!(
                f,
                "recognized speech covers only {:.0}% of the media",
                covered_fraction * 100.0
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageReport {
    pub gaps: Vec<CoverageGap>,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    pub fn has(&self, predicate: impl Fn(&CoverageGap) -> bool) -> bool {
        self.gaps.iter().any(predicate)
    }

    /// Human-readable reason naming every rule that triggered
    pub fn reason(&self) -> String {
        let parts: Vec<String> = self.gaps.iter().map(|g| g.to_string()).collect();
        format!("On-device transcript looks incomplete: {}", parts.join("; "))
    }
}

impl CoverageThresholds {
    pub fn assess(&self, segments: &[TranscriptSegment], duration_secs: Option<f64>) -> CoverageReport {
        let mut report = CoverageReport::default();
        let duration = match duration_secs {
            Some(d) if d > self.min_media_secs => d,
            _ => return report,
        };

        let Some((min_start, max_end)) = segment_span(segments) else {
            report.gaps.push(CoverageGap::LowCoverage {
                covered_fraction: 0.0,
            });
            return report;
        };

        if duration - max_end > self.max_tail_gap_secs {
            report.gaps.push(CoverageGap::TailGap {
                end: max_end,
                duration,
            });
        }

        let allowed_head = self
            .max_head_gap_secs
            .min(duration * self.max_head_gap_fraction);
        if min_start > allowed_head {
            report.gaps.push(CoverageGap::HeadGap {
                start: min_start,
                allowed: allowed_head,
            });
        }

        let covered = (max_end.min(duration) - min_start.max(0.0)).max(0.0) / duration;
        if covered < self.min_coverage_fraction {
            report.gaps.push(CoverageGap::LowCoverage {
                covered_fraction: covered,
            });
        }

        report
    }
}

/// What the policy needs to know about the attempt that just finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    pub mode: RecognitionMode,
    /// Automatic retries already spent on this parameter set
    pub retries: u8,
    pub bypass_cache: bool,
}

impl AttemptContext {
    pub fn new(mode: RecognitionMode) -> Self {
        Self {
            mode,
            retries: 0,
            bypass_cache: false,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.retries > 0
    }

    pub fn retried(self) -> Self {
        Self {
            retries: self.retries.saturating_add(1),
            ..self
        }
    }

    pub fn escalated(self) -> Self {
        Self {
            mode: RecognitionMode::Server,
            retries: 0,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackContext {
    /// The user already agreed to server recognition for this media
    pub allowed: bool,
    pub server_available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureDecision {
    Retry { delay: Duration },
    EscalateToServer,
    RequestConsent { reason: String },
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuccessDecision {
    Accept,
    EscalateToServer { reason: String },
    RequestConsent { reason: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    settings: RetrySettings,
    coverage: CoverageThresholds,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings, coverage: CoverageThresholds) -> Self {
        Self { settings, coverage }
    }

    pub fn should_retry(&self, attempt: &AttemptContext, error: &TranscriptionError) -> bool {
        if attempt.retries >= self.settings.max_retries {
            return false;
        }

        error.is_transient() && !error.indicates_unreadable_file()
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.settings.delay_ms)
    }

    pub fn decide_failure(
        &self,
        error: &TranscriptionError,
        attempt: &AttemptContext,
        fallback: FallbackContext,
    ) -> FailureDecision {
        if let TranscriptionError::FallbackRequired(reason) = error {
            if !fallback.server_available || attempt.mode == RecognitionMode::Server {
                return FailureDecision::Terminal;
            }
            if fallback.allowed {
                return FailureDecision::EscalateToServer;
            }
            return FailureDecision::RequestConsent {
                reason: reason.clone(),
            };
        }

        if self.should_retry(attempt, error) {
            return FailureDecision::Retry {
                delay: self.retry_delay(),
            };
        }

        FailureDecision::Terminal
    }

    pub fn decide_success(
        &self,
        segments: &[TranscriptSegment],
        duration_secs: Option<f64>,
        attempt: &AttemptContext,
        fallback: FallbackContext,
    ) -> SuccessDecision {
        if attempt.mode != RecognitionMode::OnDevice || !fallback.server_available {
            return SuccessDecision::Accept;
        }

        let report = self.coverage.assess(segments, duration_secs);
        if report.is_complete() {
            return SuccessDecision::Accept;
        }

        let reason = report.reason();
        if fallback.allowed {
            SuccessDecision::EscalateToServer { reason }
        } else {
            SuccessDecision::RequestConsent { reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: f64, end: f64) -> Vec<TranscriptSegment> {
        vec![TranscriptSegment::from_tokens(start, end, vec!["x".into()])]
    }

    const OFFLINE: FallbackContext = FallbackContext {
        allowed: false,
        server_available: true,
    };
    const ONLINE: FallbackContext = FallbackContext {
        allowed: true,
        server_available: true,
    };

    #[test]
    fn late_start_is_incomplete() {
        let report = CoverageThresholds::default().assess(&span(20.0, 100.0), Some(120.0));
        assert!(report.has(|g| matches!(g, CoverageGap::HeadGap { .. })));
        assert!(report.reason().contains("starts at 20.0s"));
    }

    #[test]
    fn early_start_passes_head_and_ratio_rules() {
        let report = CoverageThresholds::default().assess(&span(0.0, 100.0), Some(120.0));
        assert!(!report.has(|g| matches!(g, CoverageGap::HeadGap { .. })));
        assert!(!report.has(|g| matches!(g, CoverageGap::LowCoverage { .. })));
        // 20s of trailing silence still trips the tail rule
        assert!(report.has(|g| matches!(g, CoverageGap::TailGap { .. })));

        let full = CoverageThresholds::default().assess(&span(0.0, 115.0), Some(120.0));
        assert!(full.is_complete());
    }

    #[test]
    fn short_media_is_always_complete() {
        let report = CoverageThresholds::default().assess(&span(10.0, 12.0), Some(30.0));
        assert!(report.is_complete());
        assert!(CoverageThresholds::default().assess(&span(10.0, 12.0), None).is_complete());
    }

    #[test]
    fn low_coverage_detected() {
        let report = CoverageThresholds::default().assess(&span(2.0, 40.0), Some(100.0));
        assert!(report.has(|g| matches!(g, CoverageGap::LowCoverage { .. })));
    }

    #[test]
    fn transient_errors_retry_once() {
        let policy = RetryPolicy::default();
        let first = AttemptContext::new(RecognitionMode::OnDevice);

        assert!(matches!(
            policy.decide_failure(&TranscriptionError::NoSpeechDetected, &first, OFFLINE),
            FailureDecision::Retry { .. }
        ));
        assert_eq!(
            policy.decide_failure(&TranscriptionError::NoSpeechDetected, &first.retried(), OFFLINE),
            FailureDecision::Terminal
        );
    }

    #[test]
    fn broken_files_are_not_retried() {
        let policy = RetryPolicy::default();
        let first = AttemptContext::new(RecognitionMode::OnDevice);
        let err = TranscriptionError::EngineUnavailable("could not open file".into());
        assert_eq!(policy.decide_failure(&err, &first, OFFLINE), FailureDecision::Terminal);
        assert_eq!(
            policy.decide_failure(&TranscriptionError::Timeout, &first, OFFLINE),
            FailureDecision::Terminal
        );
    }

    #[test]
    fn fallback_required_needs_consent() {
        let policy = RetryPolicy::default();
        let first = AttemptContext::new(RecognitionMode::OnDevice);
        let err = TranscriptionError::FallbackRequired("no local model".into());

        assert_eq!(
            policy.decide_failure(&err, &first, OFFLINE),
            FailureDecision::RequestConsent {
                reason: "no local model".into()
            }
        );
        assert_eq!(
            policy.decide_failure(&err, &first, ONLINE),
            FailureDecision::EscalateToServer
        );
        let no_server = FallbackContext {
            allowed: true,
            server_available: false,
        };
        assert_eq!(policy.decide_failure(&err, &first, no_server), FailureDecision::Terminal);
    }

    #[test]
    fn incomplete_local_result_escalates_or_asks() {
        let policy = RetryPolicy::default();
        let local = AttemptContext::new(RecognitionMode::OnDevice);
        let segments = span(20.0, 100.0);

        assert!(matches!(
            policy.decide_success(&segments, Some(120.0), &local, OFFLINE),
            SuccessDecision::RequestConsent { .. }
        ));
        assert!(matches!(
            policy.decide_success(&segments, Some(120.0), &local, ONLINE),
            SuccessDecision::EscalateToServer { .. }
        ));
        assert_eq!(
            policy.decide_success(&segments, Some(120.0), &local.escalated(), ONLINE),
            SuccessDecision::Accept
        );
    }
}
