//! The interaction engine: one `start_processing` call runs one listen, think,
//! respond cycle and reports every transition as a `stateChange` event.
//!
//! ```text
//! Idle ──► ListeningStart ──► ThinkingStart ──┬──► SpeakingStart ──► Idle
//!              │                    │         ├──► Idle   (functions / text only)
//!              └──► Idle            ├──► Idle └──► Idle   (empty reply)
//!                (capture failed)   └──► Frozen (401 / 403 / 429)
//! ```
//!
//! At most one cycle runs at a time; a call made while one is pending returns
//! [`CycleOutcome::Busy`] without emitting anything or touching a device.

use crate::api::{
    HttpBackend, ProcessorBackend, ProcessorRequest, ReplyData, SdkMetadata, SDK_VERSION,
};
use crate::broadcaster::{Listener, StateBroadcaster};
use crate::capture::{
    AudioRecorder, CaptureMethod, CapturedInput, CpalMicrophone, FallbackCapture, InputCapture,
    Microphone, SpeechRecognizer, SpeechToTextCapture, SttRecognizer,
};
use crate::config::EngineConfig;
use crate::error::{ErrorClass, VoiceResult};
use crate::functions::{ExecutionReport, FunctionRegistry, VoiceFunction};
use crate::page::PageContextProvider;
use crate::playback::{AudioSession, PlaybackOutcome, ReplyPlayback, ReplySource, StopSignal};
use crate::state::{InteractionState, STATE_CHANGE_EVENT};
use crate::stt::{create_best_stt, SttBackend};
use crate::user::{FileIdentityStore, IdentityStore, UserIdentity};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Text event carrying the processor's transcription of the command.
pub const INPUT_TRANSCRIPT_EVENT: &str = "inputTranscript";
/// Text event carrying the processor's written reply.
pub const TEXT_REPLY_EVENT: &str = "textReply";

/// How a `start_processing` call ended. Every variant except `Busy` is
/// preceded by a final `Idle` (or `Frozen`) state event.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle was in flight; nothing happened.
    Busy,
    CaptureFailed,
    RequestFailed,
    /// The processor refused access; the engine is frozen until the next start.
    Frozen,
    /// The reply had nothing to execute, say or show.
    EmptyReply,
    Completed {
        functions: Option<ExecutionReport>,
        playback: Option<PlaybackOutcome>,
    },
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Returns the engine to `Idle` when a cycle future is dropped before it reached
/// a resting state (a host timeout, a cancelled `select!`, shutdown).
struct CycleGuard<'a> {
    engine: &'a InteractionEngine,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self.engine.last_state().is_resting() {
            return;
        }
        warn!(target: "vuic::engine", "interaction cancelled; returning to idle");
        self.engine.capture.stop();
        self.engine.playback.stop_current();
        self.engine.emit_state(InteractionState::Idle);
    }
}

pub struct InteractionEngine {
    config: EngineConfig,
    states: StateBroadcaster<InteractionState>,
    texts: StateBroadcaster<String>,
    last_state: Mutex<InteractionState>,
    capture: Arc<dyn InputCapture>,
    playback: ReplyPlayback,
    backend: Arc<dyn ProcessorBackend>,
    registry: RwLock<Arc<FunctionRegistry>>,
    identity: UserIdentity,
    page: Option<Arc<dyn PageContextProvider>>,
    in_flight: AtomicBool,
    cycles: AtomicU64,
}

impl InteractionEngine {
    /// Engine on the default devices and the HTTP backend.
    pub fn initialize(config: EngineConfig) -> VoiceResult<Self> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register_functions(&self, functions: Vec<VoiceFunction>) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        Arc::make_mut(&mut registry).register_functions(functions);
    }

    /// Subscribe to `stateChange` (or any state event name).
    pub fn on<F>(&self, event: &str, listener: F) -> Listener<InteractionState>
    where
        F: Fn(&InteractionState) + Send + Sync + 'static,
    {
        self.states.on(event, listener)
    }

    pub fn off(&self, event: &str, listener: &Listener<InteractionState>) {
        self.states.off(event, listener)
    }

    /// Subscribe to `inputTranscript` or `textReply`.
    pub fn on_text<F>(&self, event: &str, listener: F) -> Listener<String>
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.texts.on(event, listener)
    }

    pub fn off_text(&self, event: &str, listener: &Listener<String>) {
        self.texts.off(event, listener)
    }

    /// Last state emitted. Informational only; listeners are the source of truth.
    pub fn last_state(&self) -> InteractionState {
        *self.last_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Halt the spoken reply. The cycle then finishes with `Idle` as usual.
    pub fn stop_speaking(&self) {
        info!(target: "vuic::engine", "stop speaking requested");
        self.playback.stop_current();
    }

    /// End the current recording early. Returns false when nothing is recording.
    pub fn stop_recording(&self) -> bool {
        self.capture.stop()
    }

    /// Run one interaction cycle.
    ///
    /// Only configuration errors (for example a reply naming functions when none
    /// are registered) are returned as `Err`, after the final `Idle`.
    pub async fn start_processing(&self) -> VoiceResult<CycleOutcome> {
        let Some(_in_flight) = InFlightGuard::acquire(&self.in_flight) else {
            warn!(target: "vuic::engine", "interaction already in progress; ignoring start");
            return Ok(CycleOutcome::Busy);
        };
        let _cycle = CycleGuard { engine: self };
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        self.run_cycle().instrument(info_span!("interaction", cycle)).await
    }

    async fn run_cycle(&self) -> VoiceResult<CycleOutcome> {
        info!(target: "vuic::engine", "startProcessing");
        self.emit_state(InteractionState::ListeningStart);

        let session = self.playback.session();
        if !session.is_unlocked() {
            match session.unlock().await {
                Ok(_) => debug!(target: "vuic::engine", "audio session opened"),
                Err(e) => warn!(target: "vuic::engine", "audio output unavailable: {}", e),
            }
        }
        self.playback.play_start_tone();

        let input = match self.capture.capture().await {
            Ok(input) => input,
            Err(e) => {
                error!(target: "vuic::engine", "could not capture the command: {}", e);
                self.emit_state(InteractionState::Idle);
                return if e.class() == ErrorClass::Configuration {
                    Err(e)
                } else {
                    Ok(CycleOutcome::CaptureFailed)
                };
            }
        };

        self.emit_state(InteractionState::ThinkingStart);
        let request = self.build_request(input);
        let reply = match self.backend.run(&request).await {
            Ok(reply) => reply,
            Err(e) if e.is_access_denied() => {
                error!(target: "vuic::engine", "processor refused access: {}", e);
                self.emit_state(InteractionState::Frozen);
                return Ok(CycleOutcome::Frozen);
            }
            Err(e) => {
                error!(target: "vuic::engine", "processor request failed: {}", e);
                self.emit_state(InteractionState::Idle);
                return if e.class() == ErrorClass::Configuration {
                    Err(e)
                } else {
                    Ok(CycleOutcome::RequestFailed)
                };
            }
        };

        self.dispatch(reply).await
    }

    fn build_request(&self, input: CapturedInput) -> ProcessorRequest {
        let signatures = self.registry_snapshot().signatures().to_vec();
        let page_content = if self.config.scrape_content {
            self.page.as_ref().and_then(|p| p.page_content())
        } else {
            None
        };
        ProcessorRequest {
            sdk_version: SDK_VERSION.to_string(),
            sdk_metadata: SdkMetadata::default(),
            end_user: self.identity.end_user(),
            signatures,
            input,
            page_content,
        }
    }

    async fn dispatch(&self, reply: ReplyData) -> VoiceResult<CycleOutcome> {
        if self.config.debug {
            debug!(target: "vuic::engine", reply = ?reply, "processor reply");
        }

        if let Some(transcript) = reply.transcript() {
            debug!(target: "vuic::engine", "User command as text: {}", transcript);
            self.texts.emit(INPUT_TRANSCRIPT_EVENT, &transcript.to_string());
        }
        if let Some(text) = reply.text() {
            info!(target: "vuic::engine", "AI reply as text: {}", text);
            self.texts.emit(TEXT_REPLY_EVENT, &text.to_string());
        }

        let mut functions = None;
        if !reply.executable_functions.is_empty() {
            match self.registry_snapshot().execute_functions(&reply.executable_functions) {
                Ok(report) => {
                    info!(target: "vuic::engine", ?report, "voice functions executed");
                    functions = Some(report);
                }
                Err(e) => {
                    error!(target: "vuic::engine", "{}", e);
                    self.emit_state(InteractionState::Idle);
                    return Err(e);
                }
            }
        }

        if reply.has_audio() {
            let stop = self.playback.stop_signal();
            self.emit_state(InteractionState::SpeakingStart);
            let outcome = self.play_audio_reply(&reply, stop).await;
            info!(target: "vuic::engine", ?outcome, "audio reply finished");
            self.emit_state(InteractionState::Idle);
            return Ok(CycleOutcome::Completed {
                functions,
                playback: Some(outcome),
            });
        }

        if functions.is_some() || reply.text().is_some() {
            self.emit_state(InteractionState::Idle);
            self.playback.play_end_tone();
            return Ok(CycleOutcome::Completed {
                functions,
                playback: None,
            });
        }

        error!(target: "vuic::engine", "processor reply has nothing to execute, play or show");
        self.emit_state(InteractionState::Idle);
        Ok(CycleOutcome::EmptyReply)
    }

    async fn play_audio_reply(&self, reply: &ReplyData, stop: StopSignal) -> PlaybackOutcome {
        let source = if let Some(url) = reply.audio_url() {
            ReplySource::Url(url.to_string())
        } else {
            // has_audio() guarantees text when streaming.
            let text = reply.text().unwrap_or_default();
            match self.backend.audio_stream(text).await {
                Ok(stream) => ReplySource::Stream(stream),
                Err(e) => {
                    error!(target: "vuic::engine", "could not open reply audio stream: {}", e);
                    return PlaybackOutcome::Failed;
                }
            }
        };
        self.playback.play_reply_until(source, stop).await
    }

    fn registry_snapshot(&self) -> Arc<FunctionRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn emit_state(&self, state: InteractionState) {
        *self.last_state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        debug!(target: "vuic::engine", state = state.as_str(), "state change");
        self.states.emit(STATE_CHANGE_EVENT, &state);
    }
}

/// Speech-to-text backend selection for the native capture wiring.
enum SttChoice {
    Detect,
    Use(Arc<dyn SttBackend>),
    Disabled,
}

/// Wires an [`InteractionEngine`]. Anything not supplied uses the native default.
pub struct EngineBuilder {
    config: EngineConfig,
    microphone: Option<Arc<dyn Microphone>>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    stt: SttChoice,
    capture: Option<Arc<dyn InputCapture>>,
    session: Option<AudioSession>,
    backend: Option<Arc<dyn ProcessorBackend>>,
    identity_store: Option<Arc<dyn IdentityStore>>,
    page: Option<Arc<dyn PageContextProvider>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            microphone: None,
            recognizer: None,
            stt: SttChoice::Detect,
            capture: None,
            session: None,
            backend: None,
            identity_store: None,
            page: None,
        }
    }

    pub fn microphone(mut self, microphone: Arc<dyn Microphone>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    /// Recognizer for the speech-to-text strategy; takes precedence over an STT backend.
    pub fn speech_recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn stt_backend(mut self, backend: Arc<dyn SttBackend>) -> Self {
        self.stt = SttChoice::Use(backend);
        self
    }

    /// Use audio recording only.
    pub fn without_speech_to_text(mut self) -> Self {
        self.stt = SttChoice::Disabled;
        self
    }

    /// Replace the whole capture pipeline (microphone, recognizer and fallback).
    pub fn capture(mut self, capture: Arc<dyn InputCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn audio_session(mut self, session: AudioSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ProcessorBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn identity_store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.identity_store = Some(store);
        self
    }

    pub fn page_context(mut self, page: Arc<dyn PageContextProvider>) -> Self {
        self.page = Some(page);
        self
    }

    pub fn build(self) -> VoiceResult<InteractionEngine> {
        let EngineBuilder {
            config,
            microphone,
            recognizer,
            stt,
            capture,
            session,
            backend,
            identity_store,
            page,
        } = self;
        config.validate()?;

        info!(target: "vuic::engine", "Initializing vuic engine version {}", SDK_VERSION);
        info!(target: "vuic::engine", "Using access key: {}", config.redacted_key());
        info!(target: "vuic::engine", "Using base URL: {}", config.base_url());

        let backend = match backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::new(&config)?) as Arc<dyn ProcessorBackend>,
        };
        let capture = match capture {
            Some(capture) => capture,
            None => native_capture(&config, microphone, recognizer, stt),
        };

        let http = reqwest::Client::builder().timeout(config.request_timeout()).build()?;
        let session = session.unwrap_or_else(AudioSession::native);
        let playback = ReplyPlayback::new(session, config.playback.clone())?.with_http_client(http);

        let store = identity_store.unwrap_or_else(|| {
            Arc::new(FileIdentityStore::in_dir(&config.data_dir)) as Arc<dyn IdentityStore>
        });
        let identity = UserIdentity::new(config.user_id.clone(), store);

        Ok(InteractionEngine {
            config,
            states: StateBroadcaster::new(),
            texts: StateBroadcaster::new(),
            last_state: Mutex::new(InteractionState::Idle),
            capture,
            playback,
            backend,
            registry: RwLock::new(Arc::new(FunctionRegistry::new())),
            identity,
            page,
            in_flight: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        })
    }
}

fn native_capture(
    config: &EngineConfig,
    microphone: Option<Arc<dyn Microphone>>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    stt: SttChoice,
) -> Arc<dyn InputCapture> {
    let capture_config = &config.capture;
    let microphone = microphone.unwrap_or_else(|| Arc::new(CpalMicrophone::new()));
    let recording: Arc<dyn InputCapture> = Arc::new(AudioRecorder::new(
        Arc::clone(&microphone),
        capture_config.recorder.clone(),
    ));

    let recognizer = recognizer.or_else(|| {
        let backend = match stt {
            SttChoice::Use(backend) => Some(backend),
            SttChoice::Detect => create_best_stt().map(Arc::from),
            SttChoice::Disabled => None,
        }?;
        info!(target: "vuic::engine", "speech-to-text via {}", backend.name());
        let recorder = AudioRecorder::new(microphone, capture_config.recorder.clone());
        Some(Arc::new(SttRecognizer::new(recorder, backend)) as Arc<dyn SpeechRecognizer>)
    });
    let speech = recognizer.map(|r| {
        let language = capture_config.language.clone();
        Arc::new(SpeechToTextCapture::new(r, language)) as Arc<dyn InputCapture>
    });

    let strategies = match (capture_config.primary, speech) {
        (CaptureMethod::AudioRecording, Some(speech)) => vec![recording, speech],
        (CaptureMethod::SpeechToText, Some(speech)) => vec![speech, recording],
        (primary, None) => {
            if primary == CaptureMethod::SpeechToText {
                warn!(
                    target: "vuic::engine",
                    "speech-to-text unavailable; recording audio instead"
                );
            }
            vec![recording]
        }
    };
    Arc::new(FallbackCapture::new(strategies, capture_config.attempts()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;

    #[test]
    fn in_flight_guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = InFlightGuard::acquire(&flag).unwrap();
        assert!(InFlightGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(InFlightGuard::acquire(&flag).is_some());
    }

    #[test]
    fn blank_key_fails_initialization() {
        let mut config = EngineConfig::new("key").unwrap();
        config.api_key = "  ".to_string();
        assert!(matches!(EngineBuilder::new(config).build(), Err(VoiceError::MissingApiKey)));
    }
}
