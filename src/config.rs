use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::orchestrator::{CompatibilityThresholds, CoverageThresholds, RetrySettings};

const CONFIG_FILE: &str = "subtitle-coordinator.json";
const API_KEY_XOR_KEY: &[u8] = b"subtitle-local-key-v1";

pub const DEFAULT_LOCALE: &str = "en-US";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_CACHE_DIR: &str = "transcripts";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Recognition timeout: `max(min_secs, duration × multiplier)`, or a flat
/// limit when the media duration is unknown
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub min_secs: u64,
    pub duration_multiplier: f64,
    pub unknown_duration_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            min_secs: 120,
            duration_multiplier: 2.0,
            unknown_duration_secs: 600,
        }
    }
}

impl TimeoutSettings {
    pub fn limit_for(&self, duration_secs: Option<f64>) -> Duration {
        match duration_secs.filter(|d| d.is_finite() && *d > 0.0) {
            Some(duration) => {
                let scaled = duration * self.duration_multiplier;
                Duration::from_secs_f64(scaled.max(self.min_secs as f64))
            }
            None => Duration::from_secs(self.unknown_duration_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub locale: String,
    pub cache_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub whisper_bin: Option<PathBuf>,
    pub whisper_model: Option<PathBuf>,
    pub whisper_threads: Option<u16>,
    pub server_api_key_obfuscated: Option<String>,
    pub server_model: Option<String>,
    pub server_endpoint: Option<String>,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
    pub coverage: CoverageThresholds,
    pub compatibility: CompatibilityThresholds,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            locale: DEFAULT_LOCALE.to_string(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            ffmpeg_path: PathBuf::from(DEFAULT_FFMPEG),
            whisper_bin: None,
            whisper_model: None,
            whisper_threads: None,
            server_api_key_obfuscated: None,
            server_model: None,
            server_endpoint: None,
            timeouts: TimeoutSettings::default(),
            retry: RetrySettings::default(),
            coverage: CoverageThresholds::default(),
            compatibility: CompatibilityThresholds::default(),
        }
    }
}

/// Config view safe to print
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub locale: String,
    pub cache_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub whisper_bin: Option<PathBuf>,
    pub whisper_model: Option<PathBuf>,
    pub has_api_key: bool,
    pub api_key_masked: Option<String>,
    pub server_model: Option<String>,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
    pub coverage: CoverageThresholds,
    pub compatibility: CompatibilityThresholds,
}

impl AppConfig {
    pub fn api_key(&self) -> Option<String> {
        self.server_api_key_obfuscated
            .as_deref()
            .and_then(deobfuscate_api_key)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }

    pub fn set_api_key(&mut self, api_key: Option<&str>) {
        self.server_api_key_obfuscated = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(obfuscate_api_key);
    }

    /// Environment wins over the file; call after `dotenvy::dotenv()`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = env::var("GROQ_API_KEY") {
            self.set_api_key(Some(&key));
        }
        if let Ok(bin) = env::var("WHISPER_CPP_BIN") {
            self.whisper_bin = Some(PathBuf::from(bin));
        }
        if let Ok(model) = env::var("WHISPER_MODEL") {
            self.whisper_model = Some(PathBuf::from(model));
        }
        if let Ok(ffmpeg) = env::var("FFMPEG_BIN") {
            self.ffmpeg_path = PathBuf::from(ffmpeg);
        }
        if let Ok(locale) = env::var("TRANSCRIBE_LOCALE") {
            self.locale = normalize_locale(&locale);
        }
        if let Ok(dir) = env::var("TRANSCRIPT_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
    }

    pub fn summary(&self) -> ConfigSummary {
        let key = self.api_key();
        ConfigSummary {
            locale: self.locale.clone(),
            cache_dir: self.cache_dir.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            whisper_bin: self.whisper_bin.clone(),
            whisper_model: self.whisper_model.clone(),
            has_api_key: key.is_some(),
            api_key_masked: key.as_deref().map(mask_api_key),
            server_model: self.server_model.clone(),
            timeouts: self.timeouts,
            retry: self.retry,
            coverage: self.coverage,
            compatibility: self.compatibility,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    env::var("SUBTITLE_COORDINATOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CONFIG_FILE))
}

pub fn normalize_locale(input: &str) -> String {
    let trimmed = input.trim().replace('_', "-");
    if trimmed.is_empty() {
        return DEFAULT_LOCALE.to_string();
    }
    let mut parts = trimmed.split('-');
    let language = parts.next().unwrap_or_default().to_ascii_lowercase();
    match parts.next() {
        Some(region) if !region.is_empty() => format!("{}-{}", language, region.to_ascii_uppercase()),
        _ => language,
    }
}

pub fn load_or_create(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        let config = AppConfig::default();
        save(path, &config)?;
        return Ok(config);
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_json::from_str::<AppConfig>(&raw) {
        Ok(mut config) => {
            normalize_config(&mut config);
            Ok(config)
        }
        Err(e) => {
            tracing::warn!("Config {} unreadable ({}), resetting to defaults", path.display(), e);
            let backup = path.with_extension("json.bak");
            let _ = fs::copy(path, backup);
            let config = AppConfig::default();
            save(path, &config)?;
            Ok(config)
        }
    }
}

pub fn save(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn normalize_config(config: &mut AppConfig) {
    config.locale = normalize_locale(&config.locale);
    if config.ffmpeg_path.as_os_str().is_empty() {
        config.ffmpeg_path = PathBuf::from(DEFAULT_FFMPEG);
    }
    if config.cache_dir.as_os_str().is_empty() {
        config.cache_dir = PathBuf::from(DEFAULT_CACHE_DIR);
    }
}

fn obfuscate_api_key(api_key: &str) -> String {
    let mut bytes = api_key.as_bytes().to_vec();
    for (idx, byte) in bytes.iter_mut().enumerate() {
        *byte ^= API_KEY_XOR_KEY[idx % API_KEY_XOR_KEY.len()];
    }
    BASE64_STANDARD.encode(bytes)
}

fn deobfuscate_api_key(obfuscated: &str) -> Option<String> {
    let mut bytes = BASE64_STANDARD.decode(obfuscated).ok()?;
    for (idx, byte) in bytes.iter_mut().enumerate() {
        *byte ^= API_KEY_XOR_KEY[idx % API_KEY_XOR_KEY.len()];
    }
    String::from_utf8(bytes).ok()
}

pub fn mask_api_key(api_key: &str) -> String {
    if api_key.len() <= 10 || !api_key.is_ascii() {
        return "******".to_string();
    }

    let prefix = &api_key[..6];
    let suffix = &api_key[api_key.len().saturating_sub(4)..];
    format!("{}********{}", prefix, suffix)
}
