// src/cache.rs
// Transcript cache collaborator

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;

use crate::session::Transcript;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize transcript: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Storage for finished transcripts, keyed by media fingerprint
#[async_trait]
pub trait TranscriptCache: Send + Sync {
    async fn load(&self, fingerprint: &str) -> Result<Option<Transcript>, CacheError>;

    async fn save(&self, transcript: &Transcript) -> Result<(), CacheError>;

    async fn delete(&self, fingerprint: &str) -> Result<(), CacheError>;
}

/// One pretty-printed JSON file per transcript
pub struct JsonFileCache {
    dir: PathBuf,
}

impl JsonFileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        let sanitized: String = fingerprint
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", sanitized))
    }

    fn io_error(path: &Path, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl TranscriptCache for JsonFileCache {
    async fn load(&self, fingerprint: &str) -> Result<Option<Transcript>, CacheError> {
        let path = self.entry_path(fingerprint);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&path, e)),
        };

        match serde_json::from_str::<Transcript>(&raw) {
            Ok(transcript) if transcript.media_fingerprint == fingerprint => Ok(Some(transcript)),
            Ok(_) => {
                tracing::warn!("Cache entry {} belongs to another fingerprint", path.display());
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Dropping corrupt cache entry {}: {}", path.display(), e);
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    async fn save(&self, transcript: &Transcript) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;

        let path = self.entry_path(&transcript.media_fingerprint);
        let json = serde_json::to_string_pretty(transcript)?;

        // Write then rename so a crash never leaves a half-written entry behind.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(&path, e))?;

        tracing::debug!("Cached transcript at {}", path.display());
        Ok(())
    }

    async fn delete(&self, fingerprint: &str) -> Result<(), CacheError> {
        let path = self.entry_path(fingerprint);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }
}

/// In-process cache
#[derive(Default)]
pub struct MemoryCache {
    entries: TokioMutex<HashMap<String, Transcript>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn contains(&self, fingerprint: &str) -> bool {
        self.entries.lock().await.contains_key(fingerprint)
    }
}

#[async_trait]
impl TranscriptCache for MemoryCache {
    async fn load(&self, fingerprint: &str) -> Result<Option<Transcript>, CacheError> {
        Ok(self.entries.lock().await.get(fingerprint).cloned())
    }

    async fn save(&self, transcript: &Transcript) -> Result<(), CacheError> {
        self.entries
            .lock()
            .await
            .insert(transcript.media_fingerprint.clone(), transcript.clone());
        Ok(())
    }

    async fn delete(&self, fingerprint: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(fingerprint);
        Ok(())
    }
}
