use crate::stt::RecognitionMode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages in the order a caller sees them. Declaration order is the ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStage {
    Preparing,
    RequestingPermission,
    LoadingMedia,
    ExtractingAudio,
    RecognizingOnDevice,
    RecognizingServer,
    ParsingSegments,
    SavingTranscript,
    Completed,
}

impl RecognitionStage {
    pub fn recognizing(mode: RecognitionMode) -> Self {
        match mode {
            RecognitionMode::OnDevice => RecognitionStage::RecognizingOnDevice,
            RecognitionMode::Server => RecognitionStage::RecognizingServer,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Preparing => "Preparing",
            Self::RequestingPermission => "Requesting permission",
            Self::LoadingMedia => "Loading media",
            Self::ExtractingAudio => "Extracting audio",
            Self::RecognizingOnDevice => "Recognizing on device",
            Self::RecognizingServer => "Recognizing on server",
            Self::ParsingSegments => "Building subtitles",
            Self::SavingTranscript => "Saving transcript",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for RecognitionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Advisory progress report for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionProgress {
    pub stage: RecognitionStage,
    pub detail: Option<String>,
    /// Fraction in 0..=1 when the stage can measure it
    pub fraction: Option<f64>,
}

impl RecognitionProgress {
    pub fn stage(stage: RecognitionStage) -> Self {
        Self {
            stage,
            detail: None,
            fraction: None,
        }
    }

    pub fn with_fraction(stage: RecognitionStage, fraction: f64) -> Self {
        Self {
            stage,
            detail: None,
            fraction: Some(fraction.clamp(0.0, 1.0)),
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(RecognitionStage::Preparing < RecognitionStage::RequestingPermission);
        assert!(RecognitionStage::ExtractingAudio < RecognitionStage::RecognizingOnDevice);
        assert!(RecognitionStage::RecognizingServer < RecognitionStage::ParsingSegments);
        assert!(RecognitionStage::SavingTranscript < RecognitionStage::Completed);
    }

    #[test]
    fn fraction_is_clamped() {
        let p = RecognitionProgress::with_fraction(RecognitionStage::ExtractingAudio, 1.7);
        assert_eq!(p.fraction, Some(1.0));
    }
}
