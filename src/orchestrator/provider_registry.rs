use crate::config::AppConfig;
use crate::stt::{GroqRecognizer, SpeechRecognizer, WhisperCppRecognizer};
use std::sync::Arc;

/// The on-device and server recognizers available to the engine
#[derive(Clone, Default)]
pub struct RecognizerSet {
    pub on_device: Option<Arc<dyn SpeechRecognizer>>,
    pub server: Option<Arc<dyn SpeechRecognizer>>,
}

impl RecognizerSet {
    pub fn new(
        on_device: Option<Arc<dyn SpeechRecognizer>>,
        server: Option<Arc<dyn SpeechRecognizer>>,
    ) -> Self {
        Self { on_device, server }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let on_device = WhisperCppRecognizer::locate(
            config.whisper_bin.clone(),
            config.whisper_model.clone(),
        )
        .map(|whisper| match config.whisper_threads {
            Some(threads) => whisper.with_threads(threads),
            None => whisper,
        })
        .map(|whisper| Arc::new(whisper) as Arc<dyn SpeechRecognizer>);

        let server = config.api_key().and_then(|key| {
            match GroqRecognizer::new(key, config.server_model.clone()) {
                Ok(groq) => {
                    let groq = match &config.server_endpoint {
                        Some(endpoint) => groq.with_endpoint(endpoint.clone()),
                        None => groq,
                    };
                    Some(Arc::new(groq) as Arc<dyn SpeechRecognizer>)
                }
                Err(e) => {
                    tracing::warn!("Server recognizer skipped: {}", e);
                    None
                }
            }
        });

        tracing::info!(
            "Recognizers available: on-device={}, server={}",
            on_device.as_ref().map(|r| r.name()).unwrap_or("none"),
            server.as_ref().map(|r| r.name()).unwrap_or("none")
        );

        Self { on_device, server }
    }

    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    /// On-device recognizer that can handle `locale`, if any
    pub fn on_device_for(&self, locale: &str) -> Option<Arc<dyn SpeechRecognizer>> {
        self.on_device
            .as_ref()
            .filter(|r| r.supports_locale(locale))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_binaries_leave_set_empty() {
        let mut config = AppConfig::default();
        config.whisper_bin = Some(PathBuf::from("/nonexistent/whisper-cli"));
        config.whisper_model = Some(PathBuf::from("/nonexistent/ggml-base.bin"));

        let set = RecognizerSet::from_config(&config);
        assert!(set.on_device.is_none());
        assert!(!set.has_server());
    }

    #[test]
    fn api_key_enables_server() {
        let mut config = AppConfig::default();
        config.whisper_bin = Some(PathBuf::from("/nonexistent/whisper-cli"));
        config.set_api_key(Some("gsk_test_key_value"));

        let set = RecognizerSet::from_config(&config);
        assert!(set.has_server());
        assert_eq!(set.server.unwrap().name(), "Groq Whisper");
    }
}
