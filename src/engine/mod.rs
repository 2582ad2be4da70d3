// src/engine/mod.rs
// Drives one recognition attempt from media file to segments

mod gate;

pub use gate::ResolutionGate;

use crate::audio::{AudioExtractor, ExtractedAudio};
use crate::config::TimeoutSettings;
use crate::media::is_direct_audio;
use crate::orchestrator::RecognizerSet;
use crate::session::{
    RecognitionProgress, RecognitionStage, SegmentBuilder, TranscriptSegment, WordStitcher,
};
use crate::stt::{
    RecognitionMode, RecognitionRequest, RecognitionSink, RecognizerEvent, SpeechRecognizer,
    TranscriptionError, WordTiming,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type ProgressSink = Arc<dyn Fn(RecognitionProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub media_path: PathBuf,
    pub locale: String,
    pub duration_secs: Option<f64>,
    /// Only an on-device recognizer may run this attempt
    pub requires_on_device: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub segments: Vec<TranscriptSegment>,
    pub recognizer: String,
    pub mode: RecognitionMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionOutcome {
    Success(RecognitionResult),
    Failure(TranscriptionError),
    Cancelled,
}

/// Whatever ends the recognition race first
#[derive(Debug)]
enum RecognitionSignal {
    Finished { words: Vec<WordTiming>, text: String },
    Failed(TranscriptionError),
    TimedOut,
    Cancelled,
}

pub struct RecognitionEngine {
    recognizers: RecognizerSet,
    extractor: Arc<dyn AudioExtractor>,
    timeouts: TimeoutSettings,
    builder: SegmentBuilder,
}

impl RecognitionEngine {
    pub fn new(recognizers: RecognizerSet, extractor: Arc<dyn AudioExtractor>) -> Self {
        Self {
            recognizers,
            extractor,
            timeouts: TimeoutSettings::default(),
            builder: SegmentBuilder::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_segment_builder(mut self, builder: SegmentBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn has_server(&self) -> bool {
        self.recognizers.has_server()
    }

    pub fn has_on_device_for(&self, locale: &str) -> bool {
        self.recognizers.on_device_for(locale).is_some()
    }

    /// Name of the recognizer an attempt in `mode` would use
    pub fn recognizer_name(&self, mode: RecognitionMode, locale: &str) -> Option<String> {
        let recognizer = match mode {
            RecognitionMode::OnDevice => self.recognizers.on_device_for(locale),
            RecognitionMode::Server => self.recognizers.server.clone(),
        };
        recognizer.map(|r| r.name().to_string())
    }

    fn select_recognizer(
        &self,
        request: &AttemptRequest,
    ) -> Result<Arc<dyn SpeechRecognizer>, TranscriptionError> {
        if request.requires_on_device {
            return self.recognizers.on_device_for(&request.locale).ok_or_else(|| {
                TranscriptionError::FallbackRequired(format!(
                    "On-device recognition is not available for {}",
                    request.locale
                ))
            });
        }

        self.recognizers
            .server
            .clone()
            .ok_or_else(|| TranscriptionError::EngineUnavailable("No server recognizer configured".into()))
    }

    /// Runs one attempt. Always resolves exactly once, never panics on backend failure.
    pub async fn attempt(
        &self,
        request: AttemptRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> TranscriptionOutcome {
        match self.run(request, &progress, &cancel).await {
            Ok(Some(result)) => TranscriptionOutcome::Success(result),
            Ok(None) => TranscriptionOutcome::Cancelled,
            Err(e) => TranscriptionOutcome::Failure(e),
        }
    }

    async fn run(
        &self,
        request: AttemptRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Option<RecognitionResult>, TranscriptionError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        progress(RecognitionProgress::stage(RecognitionStage::Preparing));

        let recognizer = self.select_recognizer(&request)?;
        let mode = recognizer.mode();
        tracing::info!(
            "Recognition attempt: {} via {} ({})",
            request.media_path.display(),
            recognizer.name(),
            mode
        );

        progress(RecognitionProgress::stage(RecognitionStage::RequestingPermission));
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            authorized = recognizer.authorize() => authorized?,
        }

        progress(RecognitionProgress::stage(RecognitionStage::LoadingMedia));
        let metadata = tokio::fs::metadata(&request.media_path).await.map_err(|e| {
            TranscriptionError::UnreadableMedia(format!("{}: {}", request.media_path.display(), e))
        })?;
        if metadata.len() == 0 {
            return Err(TranscriptionError::UnreadableMedia(format!(
                "{} is empty",
                request.media_path.display()
            )));
        }

        // Held until recognition ends; dropping it removes the intermediate file
        let mut extracted: Option<ExtractedAudio> = None;
        let audio_path = if is_direct_audio(&request.media_path) {
            request.media_path.clone()
        } else {
            progress(RecognitionProgress::with_fraction(RecognitionStage::ExtractingAudio, 0.0));
            let forward = |fraction: f64| {
                progress(RecognitionProgress::with_fraction(
                    RecognitionStage::ExtractingAudio,
                    fraction,
                ))
            };
            let Some(audio) = self
                .extractor
                .extract(&request.media_path, request.duration_secs, &forward, cancel)
                .await?
            else {
                return Ok(None);
            };
            let path = audio.path().to_path_buf();
            extracted = Some(audio);
            path
        };

        let stage = RecognitionStage::recognizing(mode);
        progress(RecognitionProgress::with_fraction(stage, 0.0));

        let recognition = RecognitionRequest {
            audio_path,
            locale: request.locale.clone(),
            duration_secs: request.duration_secs,
        };
        let signal = self
            .race(recognizer.clone(), recognition, stage, progress, cancel)
            .await;
        drop(extracted);

        let (words, text) = match signal {
            RecognitionSignal::Finished { words, text } => (words, text),
            RecognitionSignal::Failed(e) => return Err(e),
            RecognitionSignal::TimedOut => return Err(TranscriptionError::Timeout),
            RecognitionSignal::Cancelled => return Ok(None),
        };

        progress(RecognitionProgress::stage(RecognitionStage::ParsingSegments));
        let mut segments = self.builder.build(&words);
        if segments.is_empty() {
            let text = text.trim();
            if text.is_empty() {
                return Err(TranscriptionError::NoSpeechDetected);
            }
            tracing::debug!("No word timings, using one segment for the whole media");
            segments.push(TranscriptSegment::spanning_media(text, request.duration_secs));
        }

        tracing::info!(
            "{} produced {} segments from {} words",
            recognizer.name(),
            segments.len(),
            words.len()
        );

        Ok(Some(RecognitionResult {
            segments,
            recognizer: recognizer.name().to_string(),
            mode,
        }))
    }

    /// Races the recognizer against the timeout and `cancel`; the gate keeps the first signal
    async fn race(
        &self,
        recognizer: Arc<dyn SpeechRecognizer>,
        request: RecognitionRequest,
        stage: RecognitionStage,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> RecognitionSignal {
        let stop = cancel.child_token();
        let (gate, resolved) = ResolutionGate::new(stop.clone());
        let (sink, mut events) = RecognitionSink::channel();
        let limit = self.timeouts.limit_for(request.duration_secs);
        let total = request.duration_secs;

        let recognizer_task = {
            let stop = stop.clone();
            let failures = sink.clone();
            tokio::spawn(async move {
                if let Err(e) = recognizer.recognize(request, sink, stop).await {
                    failures.fail(e);
                }
            })
        };

        let timer_task = {
            let gate = gate.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        if gate.resolve(RecognitionSignal::TimedOut) {
                            tracing::warn!("Recognition timed out after {}s", limit.as_secs());
                        }
                    }
                }
            })
        };

        let consumer_task = {
            let gate = gate.clone();
            let stop = stop.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut stitcher = WordStitcher::new();
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            gate.resolve(RecognitionSignal::Cancelled);
                            break;
                        }
                        _ = stop.cancelled() => break,
                        event = events.recv() => match event {
                            Some(RecognizerEvent::Partial(words)) => {
                                stitcher.merge(words);
                                if let Some(fraction) = stitcher.progress_update(total) {
                                    progress(RecognitionProgress::with_fraction(stage, fraction));
                                }
                            }
                            Some(RecognizerEvent::Final { words, text }) => {
                                stitcher.merge(words);
                                let words = std::mem::take(&mut stitcher).into_words();
                                gate.resolve(RecognitionSignal::Finished { words, text });
                                break;
                            }
                            Some(RecognizerEvent::Failed(e)) => {
                                gate.resolve(RecognitionSignal::Failed(e));
                                break;
                            }
                            None => {
                                gate.resolve(RecognitionSignal::Failed(TranscriptionError::Generic(
                                    "Recognizer finished without a result".into(),
                                )));
                                break;
                            }
                        }
                    }
                }
            })
        };

        drop(gate);
        let signal = resolved.await.unwrap_or_else(|_| {
            RecognitionSignal::Failed(TranscriptionError::Generic(
                "Recognition ended without a result".into(),
            ))
        });

        stop.cancel();
        recognizer_task.abort();
        timer_task.abort();
        consumer_task.abort();

        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Script {
        Events(Vec<RecognizerEvent>),
        Error(TranscriptionError),
        Hang,
    }

    struct ScriptedRecognizer {
        mode: RecognitionMode,
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn new(mode: RecognitionMode, script: Script) -> Arc<Self> {
            Arc::new(Self {
                mode,
                script,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SpeechRecognizer for ScriptedRecognizer {
        fn name(&self) -> &str {
            "scripted"
        }

        fn mode(&self) -> RecognitionMode {
            self.mode
        }

        async fn recognize(
            &self,
            _request: RecognitionRequest,
            sink: RecognitionSink,
            stop: CancellationToken,
        ) -> Result<(), TranscriptionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Events(events) => {
                    for event in events {
                        match event.clone() {
                            RecognizerEvent::Partial(words) => sink.partial(words),
                            RecognizerEvent::Final { words, text } => sink.finish(words, text),
                            RecognizerEvent::Failed(e) => sink.fail(e),
                        }
                    }
                    Ok(())
                }
                Script::Error(e) => Err(e.clone()),
                Script::Hang => {
                    stop.cancelled().await;
                    Ok(())
                }
            }
        }
    }

    struct CopyExtractor {
        dir: PathBuf,
    }

    #[async_trait]
    impl AudioExtractor for CopyExtractor {
        async fn extract(
            &self,
            source: &Path,
            _duration_secs: Option<f64>,
            progress: &(dyn Fn(f64) + Send + Sync),
            _cancel: &CancellationToken,
        ) -> Result<Option<ExtractedAudio>, TranscriptionError> {
            let out = self.dir.join("extracted.wav");
            std::fs::copy(source, &out).map_err(|e| TranscriptionError::Generic(e.to_string()))?;
            progress(0.5);
            progress(1.0);
            Ok(Some(ExtractedAudio::new(out)))
        }
    }

    fn engine(on_device: Option<Arc<ScriptedRecognizer>>, dir: &Path) -> RecognitionEngine {
        let on_device = on_device.map(|r| r as Arc<dyn SpeechRecognizer>);
        RecognitionEngine::new(
            RecognizerSet::new(on_device, None),
            Arc::new(CopyExtractor {
                dir: dir.to_path_buf(),
            }),
        )
    }

    fn media_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"RIFF....WAVEfmt ").unwrap();
        path
    }

    fn request(path: PathBuf, duration: Option<f64>) -> AttemptRequest {
        AttemptRequest {
            media_path: path,
            locale: "en-US".into(),
            duration_secs: duration,
            requires_on_device: true,
        }
    }

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<RecognitionProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |p| sink_seen.lock().unwrap().push(p));
        (sink, seen)
    }

    fn w(text: &str, start: f64) -> WordTiming {
        WordTiming::new(text, start, 0.3)
    }

    #[tokio::test]
    async fn final_result_becomes_segments() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(
            RecognitionMode::OnDevice,
            Script::Events(vec![
                RecognizerEvent::Partial(vec![w("a", 0.0)]),
                RecognizerEvent::Partial(vec![w("a", 0.0), w("b", 0.4)]),
                RecognizerEvent::Final {
                    words: vec![w("c", 2.0), w("a", 0.0), w("b", 0.4)],
                    text: "a b c".into(),
                },
            ]),
        );
        let engine = engine(Some(recognizer.clone()), dir.path());
        let (sink, seen) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "clip.wav"), Some(3.0)),
                sink,
                CancellationToken::new(),
            )
            .await;

        let TranscriptionOutcome::Success(result) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        let texts: Vec<_> = result.segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["a b", "c"]);
        assert_eq!(result.mode, RecognitionMode::OnDevice);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);

        let stages: Vec<_> = seen.lock().unwrap().iter().map(|p| p.stage).collect();
        assert!(stages.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(stages.first(), Some(&RecognitionStage::Preparing));
        assert_eq!(stages.last(), Some(&RecognitionStage::ParsingSegments));
        assert!(!stages.contains(&RecognitionStage::ExtractingAudio));
    }

    #[tokio::test]
    async fn final_keeps_words_only_seen_in_partials() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(
            RecognitionMode::OnDevice,
            Script::Events(vec![
                RecognizerEvent::Partial(vec![w("one", 0.0), w("two", 0.4)]),
                RecognizerEvent::Final {
                    words: vec![w("three", 0.8)],
                    text: "three".into(),
                },
            ]),
        );
        let engine = engine(Some(recognizer), dir.path());
        let (sink, _) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "clip.wav"), Some(3.0)),
                sink,
                CancellationToken::new(),
            )
            .await;

        let TranscriptionOutcome::Success(result) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "one two three");
        assert_eq!(result.segments[0].start, 0.0);
    }

    #[tokio::test]
    async fn text_without_timings_spans_media() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(
            RecognitionMode::OnDevice,
            Script::Events(vec![RecognizerEvent::Final {
                words: vec![],
                text: " bonjour ".into(),
            }]),
        );
        let engine = engine(Some(recognizer), dir.path());
        let (sink, _) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "clip.wav"), None),
                sink,
                CancellationToken::new(),
            )
            .await;

        let TranscriptionOutcome::Success(result) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "bonjour");
        assert_eq!(result.segments[0].start, 0.0);
        assert_eq!(result.segments[0].end, 1.0);
    }

    #[tokio::test]
    async fn empty_result_is_no_speech() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(
            RecognitionMode::OnDevice,
            Script::Events(vec![RecognizerEvent::Final {
                words: vec![WordTiming::new("  ", 0.0, 0.2)],
                text: String::new(),
            }]),
        );
        let engine = engine(Some(recognizer), dir.path());
        let (sink, _) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "clip.wav"), Some(5.0)),
                sink,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(
            outcome,
            TranscriptionOutcome::Failure(TranscriptionError::NoSpeechDetected)
        );
    }

    #[tokio::test]
    async fn recognizer_error_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(
            RecognitionMode::OnDevice,
            Script::Error(TranscriptionError::EngineUnavailable("busy".into())),
        );
        let engine = engine(Some(recognizer), dir.path());
        let (sink, _) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "clip.wav"), Some(5.0)),
                sink,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(
            outcome,
            TranscriptionOutcome::Failure(TranscriptionError::EngineUnavailable("busy".into()))
        );
    }

    #[tokio::test]
    async fn silent_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(RecognitionMode::OnDevice, Script::Events(vec![]));
        let engine = engine(Some(recognizer), dir.path());
        let (sink, _) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "clip.wav"), Some(5.0)),
                sink,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            outcome,
            TranscriptionOutcome::Failure(TranscriptionError::Generic(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_recognizer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(RecognitionMode::OnDevice, Script::Hang);
        let engine = engine(Some(recognizer), dir.path());
        let (sink, _) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "clip.wav"), Some(30.0)),
                sink,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, TranscriptionOutcome::Failure(TranscriptionError::Timeout));
    }

    #[tokio::test]
    async fn cancel_resolves_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(RecognitionMode::OnDevice, Script::Hang);
        let engine = engine(Some(recognizer.clone()), dir.path());
        let (sink, _) = recording_sink();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let watcher = recognizer.clone();
        tokio::spawn(async move {
            while watcher.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            trigger.cancel();
        });

        let outcome = engine
            .attempt(request(media_file(dir.path(), "clip.wav"), Some(30.0)), sink, cancel)
            .await;
        assert_eq!(outcome, TranscriptionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn missing_on_device_requires_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(None, dir.path());
        let (sink, _) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "clip.wav"), Some(5.0)),
                sink,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            outcome,
            TranscriptionOutcome::Failure(TranscriptionError::FallbackRequired(ref reason))
                if reason.contains("en-US")
        ));
    }

    #[tokio::test]
    async fn empty_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(RecognitionMode::OnDevice, Script::Hang);
        let engine = engine(Some(recognizer.clone()), dir.path());
        let (sink, _) = recording_sink();
        let path = dir.path().join("empty.wav");
        std::fs::write(&path, b"").unwrap();

        let outcome = engine
            .attempt(request(path, Some(5.0)), sink, CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            TranscriptionOutcome::Failure(TranscriptionError::UnreadableMedia(_))
        ));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn video_is_extracted_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = ScriptedRecognizer::new(
            RecognitionMode::OnDevice,
            Script::Events(vec![RecognizerEvent::Final {
                words: vec![w("hola", 0.0)],
                text: "hola".into(),
            }]),
        );
        let engine = engine(Some(recognizer), dir.path());
        let (sink, seen) = recording_sink();

        let outcome = engine
            .attempt(
                request(media_file(dir.path(), "movie.mp4"), Some(5.0)),
                sink,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, TranscriptionOutcome::Success(_)));

        let extraction: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.stage == RecognitionStage::ExtractingAudio)
            .filter_map(|p| p.fraction)
            .collect();
        assert_eq!(extraction, vec![0.0, 0.5, 1.0]);
        assert!(!dir.path().join("extracted.wav").exists());
    }
}
