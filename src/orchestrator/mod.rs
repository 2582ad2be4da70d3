use crate::audio::FfmpegExtractor;
use crate::cache::{JsonFileCache, TranscriptCache};
use crate::config::{normalize_locale, AppConfig, DEFAULT_LOCALE};
use crate::engine::{
    AttemptRequest, ProgressSink, RecognitionEngine, RecognitionResult, TranscriptionOutcome,
};
use crate::media::{ContentSignature, MediaIdentity, MediaItem};
use crate::session::{
    RecognitionProgress, RecognitionStage, Session, SessionSnapshot, SessionState, TerminalState,
    Transcript,
};
use crate::stt::{RecognitionMode, TranscriptionError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use self::metrics::Metrics;

pub mod compatibility;
pub mod metrics;
pub mod provider_registry;
pub mod retry;

pub use compatibility::{CompatibilityThresholds, Incompatibility};
pub use metrics::{MetricsSnapshot, RecognizerStats};
pub use provider_registry::RecognizerSet;
pub use retry::{
    AttemptContext, CoverageGap, CoverageReport, CoverageThresholds, FailureDecision,
    FallbackContext, RetryPolicy, RetrySettings, SuccessDecision,
};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("No transcription session for media {0}")]
    UnknownSession(MediaIdentity),

    #[error("Session for media {media} is {actual}, expected {expected}")]
    InvalidState {
        media: MediaIdentity,
        actual: &'static str,
        expected: &'static str,
    },
}

/// A job to put on the runtime once the session lock is released
struct Launch {
    media_id: MediaIdentity,
    generation: u64,
    cancel: CancellationToken,
    delay: Option<Duration>,
    consult_cache: bool,
}

/// Everything a job needs, copied out of the session under the lock
struct JobParams {
    media: MediaItem,
    locale: String,
    attempt: AttemptContext,
}

struct Inner {
    engine: RecognitionEngine,
    cache: Arc<dyn TranscriptCache>,
    policy: RetryPolicy,
    compatibility: CompatibilityThresholds,
    default_locale: String,
    sessions: Mutex<HashMap<MediaIdentity, Session>>,
    metrics: Mutex<Metrics>,
}

/// Owns one transcription session per media identity.
///
/// Cheap to clone; clones share the session table. Every background callback
/// carries the generation it was started under and is ignored once the
/// session moved on.
#[derive(Clone)]
pub struct TranscriptionCoordinator {
    inner: Arc<Inner>,
}

impl TranscriptionCoordinator {
    pub fn new(engine: RecognitionEngine, cache: Arc<dyn TranscriptCache>) -> Self {
        Self::with_settings(
            engine,
            cache,
            RetryPolicy::default(),
            CompatibilityThresholds::default(),
            DEFAULT_LOCALE,
        )
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::from_config_with_cache(config, Arc::new(JsonFileCache::new(&config.cache_dir)))
    }

    pub fn from_config_with_cache(config: &AppConfig, cache: Arc<dyn TranscriptCache>) -> Self {
        let engine = RecognitionEngine::new(
            RecognizerSet::from_config(config),
            Arc::new(FfmpegExtractor::new(&config.ffmpeg_path)),
        )
        .with_timeouts(config.timeouts);

        Self::with_settings(
            engine,
            cache,
            RetryPolicy::new(config.retry, config.coverage),
            config.compatibility,
            &config.locale,
        )
    }

    pub fn with_settings(
        engine: RecognitionEngine,
        cache: Arc<dyn TranscriptCache>,
        policy: RetryPolicy,
        compatibility: CompatibilityThresholds,
        default_locale: &str,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                cache,
                policy,
                compatibility,
                default_locale: normalize_locale(default_locale),
                sessions: Mutex::new(HashMap::new()),
                metrics: Mutex::new(Metrics::new()),
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<MediaIdentity, Session>> {
        match self.inner.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn metrics_mut(&self) -> MutexGuard<'_, Metrics> {
        match self.inner.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Starts transcribing `media`. A no-op while a job for it is already running.
    ///
    /// Returns the generation of the running job.
    pub fn start(&self, media: MediaItem, locale: Option<&str>) -> u64 {
        self.launch(media, locale, false)
    }

    /// Cancels any running job and transcribes again, skipping the cache
    pub fn retranscribe(&self, media_id: &MediaIdentity) -> Result<u64, CoordinatorError> {
        let media = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(media_id)
                .ok_or_else(|| CoordinatorError::UnknownSession(media_id.clone()))?;
            session.reset_to_idle();
            session.media.clone()
        };
        tracing::info!("Re-transcribing media {}", media_id);
        Ok(self.launch(media, None, true))
    }

    fn launch(&self, media: MediaItem, locale: Option<&str>, bypass_cache: bool) -> u64 {
        let media_id = media.id.clone();
        let launch = {
            let mut sessions = self.sessions();
            let session = sessions.entry(media_id.clone()).or_insert_with(|| {
                Session::new(media.clone(), self.inner.default_locale.clone())
            });

            if session.is_running() {
                tracing::debug!(
                    "Transcription for {} already running (generation {})",
                    media_id,
                    session.generation
                );
                return session.generation;
            }

            session.media = media;
            if let Some(locale) = locale {
                session.locale = normalize_locale(locale);
            }
            let mode = self.initial_mode(&session.locale, session.fallback_allowed);
            session.attempt = AttemptContext {
                bypass_cache,
                ..AttemptContext::new(mode)
            };
            session.result = None;
            let (generation, cancel) = session.begin_attempt();
            session.publish();

            tracing::info!(
                "Transcription started for {} (generation {}, {}, locale {})",
                media_id,
                generation,
                mode,
                session.locale
            );

            Launch {
                media_id: media_id.clone(),
                generation,
                cancel,
                delay: None,
                consult_cache: !bypass_cache,
            }
        };

        let generation = launch.generation;
        self.spawn_job(launch);
        generation
    }

    fn initial_mode(&self, locale: &str, fallback_allowed: bool) -> RecognitionMode {
        let engine = &self.inner.engine;
        if !engine.has_on_device_for(locale) && fallback_allowed && engine.has_server() {
            RecognitionMode::Server
        } else {
            RecognitionMode::OnDevice
        }
    }

    /// Stops the job for `media_id` and returns the session to idle
    pub fn cancel(&self, media_id: &MediaIdentity) -> Result<(), CoordinatorError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(media_id)
            .ok_or_else(|| CoordinatorError::UnknownSession(media_id.clone()))?;
        session.reset_to_idle();
        session.publish();
        tracing::info!(
            "Transcription cancelled for {} (now generation {})",
            media_id,
            session.generation
        );
        Ok(())
    }

    /// Grants server recognition for `media_id` and restarts on the server
    pub fn confirm_fallback(&self, media_id: &MediaIdentity) -> Result<u64, CoordinatorError> {
        let launch = {
            let mut sessions = self.sessions();
            let session = Self::awaiting_consent(&mut sessions, media_id)?;
            session.fallback_allowed = true;
            session.attempt = AttemptContext {
                bypass_cache: session.attempt.bypass_cache,
                ..AttemptContext::new(RecognitionMode::Server)
            };
            let (generation, cancel) = session.begin_attempt();
            session.publish();
            tracing::info!("Server fallback granted for {} (generation {})", media_id, generation);

            Launch {
                media_id: media_id.clone(),
                generation,
                cancel,
                delay: None,
                consult_cache: false,
            }
        };

        let generation = launch.generation;
        self.spawn_job(launch);
        Ok(generation)
    }

    /// Declines server recognition. A held-back on-device result is accepted as
    /// is; otherwise the session fails with the fallback reason.
    pub async fn deny_fallback(&self, media_id: &MediaIdentity) -> Result<(), CoordinatorError> {
        let pending = {
            let mut sessions = self.sessions();
            let session = Self::awaiting_consent(&mut sessions, media_id)?;
            match session.pending_result.take() {
                Some(result) => {
                    let reason = session.fallback_reason.take();
                    let (generation, _) = session.begin_attempt();
                    session.fallback_reason = reason;
                    session.publish();
                    Some((generation, result))
                }
                None => {
                    let reason = session
                        .fallback_reason
                        .clone()
                        .unwrap_or_else(|| "Server recognition declined".to_string());
                    session.next_generation();
                    session.state = SessionState::Terminal(TerminalState::Failure);
                    session.last_error = Some(TranscriptionError::FallbackRequired(reason));
                    session.publish();
                    None
                }
            }
        };

        tracing::info!("Server fallback declined for {}", media_id);
        if let Some((generation, result)) = pending {
            self.commit(media_id, generation, result).await;
        }
        Ok(())
    }

    fn awaiting_consent<'a>(
        sessions: &'a mut HashMap<MediaIdentity, Session>,
        media_id: &MediaIdentity,
    ) -> Result<&'a mut Session, CoordinatorError> {
        let session = sessions
            .get_mut(media_id)
            .ok_or_else(|| CoordinatorError::UnknownSession(media_id.clone()))?;
        if session.state != SessionState::AwaitingFallbackConsent {
            return Err(CoordinatorError::InvalidState {
                media: media_id.clone(),
                actual: session.state.label(),
                expected: SessionState::AwaitingFallbackConsent.label(),
            });
        }
        Ok(session)
    }

    /// Cancels and forgets the session
    pub fn discard(&self, media_id: &MediaIdentity) -> bool {
        match self.sessions().remove(media_id) {
            Some(session) => {
                session.stop();
                tracing::debug!("Session for {} discarded", media_id);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, media_id: &MediaIdentity) -> Option<SessionSnapshot> {
        self.sessions().get(media_id).map(Session::snapshot)
    }

    pub fn subscribe(&self, media_id: &MediaIdentity) -> Option<watch::Receiver<SessionSnapshot>> {
        self.sessions().get(media_id).map(Session::subscribe)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_mut().snapshot()
    }

    /// Progress callback from an attempt; ignored unless `generation` is current
    pub fn on_progress(&self, media_id: &MediaIdentity, generation: u64, event: RecognitionProgress) {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(media_id) else {
            return;
        };
        if !session.is_current(generation) || !session.is_running() {
            tracing::trace!("Dropping stale progress for {} (generation {})", media_id, generation);
            return;
        }
        if session.apply_progress(event) {
            session.publish();
        }
    }

    /// Terminal callback from an attempt; ignored unless `generation` is current
    pub async fn on_outcome(
        &self,
        media_id: &MediaIdentity,
        generation: u64,
        outcome: TranscriptionOutcome,
    ) {
        match outcome {
            TranscriptionOutcome::Success(result) => {
                self.settle_success(media_id, generation, result).await
            }
            TranscriptionOutcome::Failure(error) => self.settle_failure(media_id, generation, error),
            TranscriptionOutcome::Cancelled => {
                tracing::debug!("Attempt for {} (generation {}) cancelled", media_id, generation);
            }
        }
    }

    fn spawn_job(&self, launch: Launch) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_job(launch).await;
        });
    }

    async fn run_job(&self, launch: Launch) {
        let Launch {
            media_id,
            generation,
            cancel,
            delay,
            consult_cache,
        } = launch;

        if let Some(delay) = delay {
            tracing::info!("Retrying {} in {}ms", media_id, delay.as_millis());
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let Some(job) = self.job_params(&media_id, generation) else {
            return;
        };

        if consult_cache {
            if let Some(transcript) = self.cached_transcript(&job.media).await {
                self.finish_from_cache(&media_id, generation, transcript);
                return;
            }
        }

        let progress: ProgressSink = {
            let coordinator = self.clone();
            let media_id = media_id.clone();
            Arc::new(move |event| coordinator.on_progress(&media_id, generation, event))
        };
        let request = AttemptRequest {
            media_path: job.media.path.clone(),
            locale: job.locale.clone(),
            duration_secs: job.media.duration_secs,
            requires_on_device: job.attempt.mode == RecognitionMode::OnDevice,
        };

        let outcome = self.inner.engine.attempt(request, progress, cancel).await;
        self.on_outcome(&media_id, generation, outcome).await;
    }

    fn job_params(&self, media_id: &MediaIdentity, generation: u64) -> Option<JobParams> {
        let sessions = self.sessions();
        sessions
            .get(media_id)
            .filter(|s| s.is_current(generation) && s.is_running())
            .map(|s| JobParams {
                media: s.media.clone(),
                locale: s.locale.clone(),
                attempt: s.attempt,
            })
    }

    fn with_current<R>(
        &self,
        media_id: &MediaIdentity,
        generation: u64,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions();
        match sessions.get_mut(media_id) {
            Some(session) if session.is_current(generation) && session.is_running() => Some(f(session)),
            _ => {
                tracing::debug!("Ignoring stale callback for {} (generation {})", media_id, generation);
                None
            }
        }
    }

    async fn cached_transcript(&self, media: &MediaItem) -> Option<Transcript> {
        let transcript = match self.inner.cache.load(&media.fingerprint).await {
            Ok(Some(transcript)) => transcript,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Transcript cache lookup failed for {}: {}", media.id, e);
                return None;
            }
        };

        let signature = match ContentSignature::read(&media.path).await {
            Ok(signature) => signature,
            Err(e) => {
                tracing::warn!("Cannot verify cached transcript for {}: {}", media.id, e);
                return None;
            }
        };

        match self.inner.compatibility.check(&transcript, media, &signature) {
            Ok(()) => Some(transcript),
            Err(reason) => {
                tracing::info!("Discarding cached transcript for {}: {}", media.id, reason);
                if let Err(e) = self.inner.cache.delete(&media.fingerprint).await {
                    tracing::warn!("Failed to delete cached transcript for {}: {}", media.id, e);
                }
                None
            }
        }
    }

    fn finish_from_cache(&self, media_id: &MediaIdentity, generation: u64, transcript: Transcript) {
        let settled = self.with_current(media_id, generation, |session| {
            Self::settle_succeeded(session, transcript);
            session.publish();
        });
        if settled.is_some() {
            self.metrics_mut().record_cache_hit();
            tracing::info!("Using cached transcript for {}", media_id);
        }
    }

    async fn settle_success(&self, media_id: &MediaIdentity, generation: u64, result: RecognitionResult) {
        let engine = &self.inner.engine;
        let policy = self.inner.policy;
        let decision = self.with_current(media_id, generation, |session| {
            let fallback = FallbackContext {
                allowed: session.fallback_allowed,
                server_available: engine.has_server(),
            };
            policy.decide_success(
                &result.segments,
                session.media.duration_secs,
                &session.attempt,
                fallback,
            )
        });
        let Some(decision) = decision else {
            return;
        };

        match decision {
            SuccessDecision::Accept => self.commit(media_id, generation, result).await,
            SuccessDecision::EscalateToServer { reason } => {
                tracing::info!("{} for {}, switching to server recognition", reason, media_id);
                self.escalate(media_id, generation, reason);
            }
            SuccessDecision::RequestConsent { reason } => {
                self.await_consent(media_id, generation, reason, Some(result));
            }
        }
    }

    fn settle_failure(&self, media_id: &MediaIdentity, generation: u64, error: TranscriptionError) {
        let engine = &self.inner.engine;
        let policy = self.inner.policy;
        let decided = self.with_current(media_id, generation, |session| {
            let fallback = FallbackContext {
                allowed: session.fallback_allowed,
                server_available: engine.has_server(),
            };
            let recognizer = engine
                .recognizer_name(session.attempt.mode, &session.locale)
                .unwrap_or_else(|| session.attempt.mode.to_string());
            (policy.decide_failure(&error, &session.attempt, fallback), recognizer)
        });
        let Some((decision, recognizer)) = decided else {
            return;
        };
        if !matches!(error, TranscriptionError::FallbackRequired(_)) {
            self.metrics_mut().record_failure(&recognizer);
        }

        match decision {
            FailureDecision::Retry { delay } => {
                tracing::warn!("Attempt for {} failed ({}), retrying once", media_id, error);
                let launch = self.with_current(media_id, generation, |session| {
                    session.attempt = session.attempt.retried();
                    let (generation, cancel) = session.begin_attempt();
                    session.publish();
                    Launch {
                        media_id: media_id.clone(),
                        generation,
                        cancel,
                        delay: Some(delay),
                        consult_cache: false,
                    }
                });
                if let Some(launch) = launch {
                    self.metrics_mut().record_retry();
                    self.spawn_job(launch);
                }
            }
            FailureDecision::EscalateToServer => {
                tracing::info!("Attempt for {} failed ({}), switching to server", media_id, error);
                self.escalate(media_id, generation, error.to_string());
            }
            FailureDecision::RequestConsent { reason } => {
                self.await_consent(media_id, generation, reason, None);
            }
            FailureDecision::Terminal => {
                tracing::error!("Transcription failed for {}: {}", media_id, error);
                self.with_current(media_id, generation, |session| {
                    session.state = SessionState::Terminal(TerminalState::Failure);
                    session.last_error = Some(error);
                    session.publish();
                });
            }
        }
    }

    fn escalate(&self, media_id: &MediaIdentity, generation: u64, reason: String) {
        let launch = self.with_current(media_id, generation, |session| {
            session.attempt = session.attempt.escalated();
            let (generation, cancel) = session.begin_attempt();
            // a new attempt on the server restarts the visible progress
            session.last_progress = Some(
                RecognitionProgress::with_fraction(RecognitionStage::RecognizingServer, 0.0)
                    .detail(reason),
            );
            session.publish();
            Launch {
                media_id: media_id.clone(),
                generation,
                cancel,
                delay: None,
                consult_cache: false,
            }
        });
        if let Some(launch) = launch {
            self.metrics_mut().record_escalation();
            self.spawn_job(launch);
        }
    }

    fn await_consent(
        &self,
        media_id: &MediaIdentity,
        generation: u64,
        reason: String,
        pending: Option<RecognitionResult>,
    ) {
        self.with_current(media_id, generation, |session| {
            tracing::info!("Server fallback needs consent for {}: {}", media_id, reason);
            session.state = SessionState::AwaitingFallbackConsent;
            session.last_error = Some(TranscriptionError::FallbackRequired(reason.clone()));
            session.fallback_reason = Some(reason);
            session.pending_result = pending;
            session.publish();
        });
    }

    /// Validates, caches and publishes a finished result
    async fn commit(&self, media_id: &MediaIdentity, generation: u64, result: RecognitionResult) {
        let prepared = self.with_current(media_id, generation, |session| {
            session.apply_progress(RecognitionProgress::stage(RecognitionStage::SavingTranscript));
            session.publish();
            (session.media.clone(), session.locale.clone())
        });
        let Some((media, locale)) = prepared else {
            return;
        };

        let signature = match ContentSignature::read(&media.path).await {
            Ok(signature) => signature,
            Err(e) => {
                self.settle_failure(media_id, generation, e);
                return;
            }
        };

        let transcript = Transcript::new(
            media.fingerprint.clone(),
            signature,
            locale,
            result.recognizer,
            result.mode,
            result.segments,
        );

        let cacheable = match self.inner.compatibility.check(&transcript, &media, &signature) {
            Ok(()) => true,
            // an accepted partial result is shown but would be rejected on the next load
            Err(reason) if reason.is_span_rule() => {
                tracing::info!("Not caching transcript for {}: {}", media_id, reason);
                false
            }
            Err(reason) => {
                self.settle_failure(
                    media_id,
                    generation,
                    TranscriptionError::Generic(format!(
                        "Transcript does not match the media: {}",
                        reason
                    )),
                );
                return;
            }
        };

        if cacheable && self.job_params(media_id, generation).is_some() {
            if let Err(e) = self.inner.cache.save(&transcript).await {
                tracing::warn!("Failed to cache transcript for {}: {}", media_id, e);
            }
        }

        let segments = transcript.segments.len();
        let recognizer = transcript.recognizer.clone();
        let settled = self.with_current(media_id, generation, |session| {
            Self::settle_succeeded(session, transcript);
            session.publish();
        });
        if settled.is_some() {
            self.metrics_mut().record_success(&recognizer);
            tracing::info!("Transcription finished for {}: {} segments", media_id, segments);
        }
    }

    fn settle_succeeded(session: &mut Session, transcript: Transcript) {
        session.state = SessionState::Terminal(TerminalState::Success);
        session.result = Some(transcript);
        session.last_error = None;
        session.fallback_allowed = false;
        session.pending_result = None;
        session.last_progress = Some(RecognitionProgress::with_fraction(
            RecognitionStage::Completed,
            1.0,
        ));
    }
}
