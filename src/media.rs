use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use uuid::Uuid;

use crate::stt::TranscriptionError;

/// Containers the recognizers decode directly; everything else goes through extraction
pub const DIRECT_AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg"];

/// Stable identifier of an imported media item. Survives renames of the file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaIdentity(String);

impl MediaIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// File size and modification time, used to notice the file changed under a cached transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSignature {
    pub size_bytes: u64,
    pub modified_ms: i64,
}

impl ContentSignature {
    pub async fn read(path: &Path) -> Result<Self, TranscriptionError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TranscriptionError::UnreadableMedia(format!("{}: {}", path.display(), e)))?;

        if !metadata.is_file() {
            return Err(TranscriptionError::UnreadableMedia(format!(
                "{} is not a file",
                path.display()
            )));
        }

        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Ok(Self {
            size_bytes: metadata.len(),
            modified_ms,
        })
    }
}

/// An imported media item as handed over by the import layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: MediaIdentity,
    pub path: PathBuf,
    /// Content fingerprint computed at import; keys the transcript cache
    pub fingerprint: String,
    /// Duration in seconds, when the import layer could determine it
    pub duration_secs: Option<f64>,
}

impl MediaItem {
    pub fn new(id: MediaIdentity, path: impl Into<PathBuf>, fingerprint: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            fingerprint: fingerprint.into(),
            duration_secs: None,
        }
    }

    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.duration_secs = Some(duration_secs).filter(|d| d.is_finite() && *d > 0.0);
        self
    }

    pub fn is_direct_audio(&self) -> bool {
        is_direct_audio(&self.path)
    }
}

pub fn is_direct_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let ext = e.to_ascii_lowercase();
            DIRECT_AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn direct_audio_by_extension() {
        assert!(is_direct_audio(Path::new("/tmp/a.WAV")));
        assert!(is_direct_audio(Path::new("clip.mp3")));
        assert!(!is_direct_audio(Path::new("movie.mp4")));
        assert!(!is_direct_audio(Path::new("noext")));
    }

    #[test]
    fn duration_rejects_nonsense() {
        let item = MediaItem::new("m".into(), "a.mp4", "fp").with_duration(f64::NAN);
        assert_eq!(item.duration_secs, None);
        let item = MediaItem::new("m".into(), "a.mp4", "fp").with_duration(12.5);
        assert_eq!(item.duration_secs, Some(12.5));
    }

    #[tokio::test]
    async fn signature_tracks_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let sig = ContentSignature::read(file.path()).await.unwrap();
        assert_eq!(sig.size_bytes, 5);
    }

    #[tokio::test]
    async fn signature_of_missing_file_is_unreadable() {
        let err = ContentSignature::read(Path::new("/definitely/not/here.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::UnreadableMedia(_)));
    }
}
