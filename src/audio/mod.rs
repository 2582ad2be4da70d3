pub mod extract;

pub use extract::{AudioExtractor, ExtractedAudio, FfmpegExtractor};

/// Sample rate recognizers expect for extracted audio
pub const TARGET_SAMPLE_RATE: u32 = 16000;
