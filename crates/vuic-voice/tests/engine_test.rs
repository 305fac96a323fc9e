//! End-to-end interaction cycles against fake devices and a scripted processor.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use vuic_voice::{
    AudioOutput, AudioSession, ByteStream, CaptureConfig, CapturedInput, CycleOutcome,
    EngineConfig, InputCapture, InteractionEngine, InteractionState, MemoryIdentityStore,
    Microphone, MicrophoneStream, OutputChannel, PlaybackOutcome, ProcessorBackend,
    ProcessorRequest, ReplyData, VoiceError, VoiceFunction, VoiceResult, INPUT_TRANSCRIPT_EVENT,
    STATE_CHANGE_EVENT, TEXT_REPLY_EVENT,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Processor that answers from a script and records what it was sent.
#[derive(Default)]
struct ScriptedBackend {
    replies: Mutex<VecDeque<VoiceResult<ReplyData>>>,
    requests: Mutex<Vec<ProcessorRequest>>,
    streamed: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    fn new(replies: Vec<VoiceResult<ReplyData>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    fn slow(reply: ReplyData, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(vec![Ok(reply)].into()),
            delay: Some(delay),
            ..Self::default()
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessorBackend for ScriptedBackend {
    async fn run(&self, request: &ProcessorRequest) -> VoiceResult<ReplyData> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(VoiceError::Protocol("script exhausted".into())))
    }

    async fn audio_stream(&self, text: &str) -> VoiceResult<ByteStream> {
        self.streamed.lock().unwrap().push(text.to_string());
        let chunks: Vec<VoiceResult<Bytes>> =
            vec![Ok(Bytes::from_static(b"ok-part-1")), Ok(Bytes::from_static(b"-2"))];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Capture that always hears the same command, or always fails.
struct FixedCapture {
    result: Result<String, String>,
    calls: AtomicUsize,
}

impl FixedCapture {
    fn heard(text: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Err(reason.to_string()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl InputCapture for FixedCapture {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn capture(&self) -> VoiceResult<CapturedInput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(text) => Ok(CapturedInput::Transcript(text.clone())),
            Err(reason) => Err(VoiceError::DeviceNotFound(reason.clone())),
        }
    }
}

/// Plays everything except payloads starting with `b"bad"`; a reply "plays" for two polls.
#[derive(Default)]
struct FakeOutput {
    replies: Mutex<Vec<Vec<u8>>>,
    cues: AtomicUsize,
    remaining_polls: AtomicUsize,
}

impl AudioOutput for FakeOutput {
    fn enqueue(&self, channel: OutputChannel, bytes: Vec<u8>, _volume: f32) -> VoiceResult<()> {
        if bytes.starts_with(b"bad") {
            return Err(VoiceError::Playback("undecodable".into()));
        }
        match channel {
            OutputChannel::Cue => {
                self.cues.fetch_add(1, Ordering::SeqCst);
            }
            OutputChannel::Reply => {
                self.remaining_polls.fetch_add(2, Ordering::SeqCst);
                self.replies.lock().unwrap().push(bytes);
            }
        }
        Ok(())
    }

    fn is_playing(&self, channel: OutputChannel) -> bool {
        channel == OutputChannel::Reply
            && self
                .remaining_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }

    fn stop(&self, _channel: OutputChannel) {
        self.remaining_polls.store(0, Ordering::SeqCst);
    }
}

/// Microphone that delivers a short burst and then ends, counting releases.
#[derive(Default)]
struct BurstMic {
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl Microphone for BurstMic {
    async fn open(&self) -> VoiceResult<MicrophoneStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(VoiceError::PermissionDenied("microphone access denied".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            let _ = tx.send(vec![0.2f32; 160]);
        }
        drop(tx);
        let releases = Arc::clone(&self.releases);
        Ok(MicrophoneStream::new(16000, rx, move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Microphone that keeps delivering speech-level audio every 20 ms until released.
#[derive(Default)]
struct LiveMic {
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

#[async_trait]
impl Microphone for LiveMic {
    async fn open(&self) -> VoiceResult<MicrophoneStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while tx.send(vec![0.3f32; 320]).is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        let releases = Arc::clone(&self.releases);
        Ok(MicrophoneStream::new(16000, rx, move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

struct Harness {
    engine: InteractionEngine,
    states: Arc<Mutex<Vec<InteractionState>>>,
    texts: Arc<Mutex<Vec<(String, String)>>>,
    output: Arc<FakeOutput>,
}

impl Harness {
    fn states(&self) -> Vec<InteractionState> {
        self.states.lock().unwrap().clone()
    }
}

fn config() -> EngineConfig {
    EngineConfig::new("test-key").unwrap()
}

fn harness_with(builder: vuic_voice::EngineBuilder) -> Harness {
    let output = Arc::new(FakeOutput::default());
    let session_output = Arc::clone(&output);
    let engine = builder
        .audio_session(AudioSession::new(move || {
            Ok(session_output.clone() as Arc<dyn AudioOutput>)
        }))
        .identity_store(Arc::new(MemoryIdentityStore::new()))
        .build()
        .unwrap();

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    engine.on(STATE_CHANGE_EVENT, move |state| sink.lock().unwrap().push(*state));

    let texts = Arc::new(Mutex::new(Vec::new()));
    for event in [INPUT_TRANSCRIPT_EVENT, TEXT_REPLY_EVENT] {
        let sink = Arc::clone(&texts);
        engine.on_text(event, move |text| {
            sink.lock().unwrap().push((event.to_string(), text.clone()))
        });
    }

    Harness {
        engine,
        states,
        texts,
        output,
    }
}

fn harness(capture: Arc<dyn InputCapture>, backend: Arc<ScriptedBackend>) -> Harness {
    harness_with(InteractionEngine::builder(config()).capture(capture).backend(backend))
}

fn reply(value: serde_json::Value) -> ReplyData {
    serde_json::from_value(value).unwrap()
}

fn denied(status: u16) -> VoiceError {
    VoiceError::Http {
        status,
        message: "nope".into(),
    }
}

use InteractionState::*;

#[tokio::test]
async fn access_denied_freezes_without_idle() {
    let h = harness(FixedCapture::heard("hello"), ScriptedBackend::new(vec![Err(denied(403))]));

    let outcome = h.engine.start_processing().await.unwrap();

    assert_eq!(outcome, CycleOutcome::Frozen);
    assert_eq!(h.states(), vec![ListeningStart, ThinkingStart, Frozen]);
    assert_eq!(h.engine.last_state(), Frozen);
}

#[tokio::test]
async fn other_request_failures_return_to_idle() {
    let backend = ScriptedBackend::new(vec![
        Err(VoiceError::Http {
            status: 500,
            message: "boom".into(),
        }),
        Err(VoiceError::Transport("connection reset".into())),
    ]);
    let h = harness(FixedCapture::heard("hello"), backend);

    assert_eq!(h.engine.start_processing().await.unwrap(), CycleOutcome::RequestFailed);
    assert_eq!(h.engine.start_processing().await.unwrap(), CycleOutcome::RequestFailed);
    assert_eq!(
        h.states(),
        vec![ListeningStart, ThinkingStart, Idle, ListeningStart, ThinkingStart, Idle]
    );
}

#[tokio::test]
async fn function_only_reply_runs_handler_once_and_never_speaks() {
    let backend = ScriptedBackend::new(vec![Ok(reply(json!({
        "executableFunctions": [
            {"function": {"name": "set_light", "arguments": "{\"room\":\"kitchen\",\"on\":true}"}}
        ]
    })))]);
    let h = harness(FixedCapture::heard("kitchen lights on"), Arc::clone(&backend));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.engine.register_functions(vec![VoiceFunction::new("set_light", "Switch a light", move |args| {
        sink.lock()
            .unwrap()
            .push((args.get_str("room").unwrap_or_default().to_string(), args.get::<bool>("on")));
        Ok(())
    })]);

    let outcome = h.engine.start_processing().await.unwrap();

    match outcome {
        CycleOutcome::Completed { functions, playback } => {
            assert_eq!(functions.unwrap().invoked, 1);
            assert!(playback.is_none());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(*seen.lock().unwrap(), vec![("kitchen".to_string(), Some(true))]);
    let states = h.states();
    assert_eq!(states.last(), Some(&Idle));
    assert!(!states.contains(&SpeakingStart));

    let sent = backend.requests.lock().unwrap();
    assert_eq!(sent[0].signatures.len(), 1);
    assert_eq!(sent[0].signatures[0].function.name, "set_light");
}

#[tokio::test]
async fn functions_without_registry_are_a_configuration_error() {
    let backend = ScriptedBackend::new(vec![Ok(reply(json!({
        "executableFunctions": [{"name": "anything", "arguments": {}}]
    })))]);
    let h = harness(FixedCapture::heard("do it"), backend);

    let err = h.engine.start_processing().await.unwrap_err();

    assert!(matches!(err, VoiceError::EmptyRegistry));
    assert_eq!(h.states().last(), Some(&Idle));
}

#[tokio::test]
async fn text_reply_emits_events_in_order() {
    let backend = ScriptedBackend::new(vec![Ok(reply(json!({
        "inputTranscript": "what time is it",
        "textReply": "It is noon."
    })))]);
    let h = harness(FixedCapture::heard("what time is it"), backend);

    let outcome = h.engine.start_processing().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Completed { playback: None, .. }));
    assert_eq!(
        *h.texts.lock().unwrap(),
        vec![
            (INPUT_TRANSCRIPT_EVENT.to_string(), "what time is it".to_string()),
            (TEXT_REPLY_EVENT.to_string(), "It is noon.".to_string()),
        ]
    );
    assert_eq!(h.states(), vec![ListeningStart, ThinkingStart, Idle]);
}

#[tokio::test]
async fn empty_reply_ends_idle() {
    let h = harness(
        FixedCapture::heard("hmm"),
        ScriptedBackend::new(vec![Ok(ReplyData::default())]),
    );

    assert_eq!(h.engine.start_processing().await.unwrap(), CycleOutcome::EmptyReply);
    assert_eq!(h.states(), vec![ListeningStart, ThinkingStart, Idle]);
}

#[tokio::test]
async fn url_reply_speaks_then_idles() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/reply.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok-mp3".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let backend = ScriptedBackend::new(vec![Ok(reply(json!({
        "textReply": "Done.",
        "audioUrlReply": format!("{}/reply.mp3", server.uri())
    })))]);
    let h = harness(FixedCapture::heard("play it"), backend);

    let outcome = h.engine.start_processing().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            functions: None,
            playback: Some(PlaybackOutcome::Completed)
        }
    );
    assert_eq!(h.states(), vec![ListeningStart, ThinkingStart, SpeakingStart, Idle]);
    assert_eq!(*h.output.replies.lock().unwrap(), vec![b"ok-mp3".to_vec()]);
    assert!(h.output.cues.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn streamed_reply_requests_audio_for_the_text() {
    let backend = ScriptedBackend::new(vec![Ok(reply(json!({
        "textReply": "Streaming now.",
        "shouldStreamAudioReply": true
    })))]);
    let h = harness(FixedCapture::heard("talk to me"), Arc::clone(&backend));

    let outcome = h.engine.start_processing().await.unwrap();

    assert!(matches!(
        outcome,
        CycleOutcome::Completed {
            playback: Some(PlaybackOutcome::Completed),
            ..
        }
    ));
    assert_eq!(*backend.streamed.lock().unwrap(), vec!["Streaming now.".to_string()]);
    assert_eq!(h.states(), vec![ListeningStart, ThinkingStart, SpeakingStart, Idle]);
    assert_eq!(h.output.replies.lock().unwrap().concat(), b"ok-part-1-2".to_vec());
}

#[tokio::test(start_paused = true)]
async fn overlapping_start_is_rejected() {
    let backend =
        ScriptedBackend::slow(reply(json!({"textReply": "slow"})), Duration::from_millis(500));
    let h = harness(FixedCapture::heard("first"), Arc::clone(&backend));

    let (first, second) = tokio::join!(h.engine.start_processing(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.engine.is_busy());
        h.engine.start_processing().await
    });

    assert!(matches!(first.unwrap(), CycleOutcome::Completed { .. }));
    assert_eq!(second.unwrap(), CycleOutcome::Busy);
    assert_eq!(backend.request_count(), 1);
    assert_eq!(h.states(), vec![ListeningStart, ThinkingStart, Idle]);
    assert!(!h.engine.is_busy());
}

#[tokio::test]
async fn exhausted_capture_goes_idle_without_a_request() {
    let capture = FixedCapture::failing("no microphone");
    let backend = ScriptedBackend::new(vec![]);
    let h = harness(Arc::clone(&capture) as Arc<dyn InputCapture>, Arc::clone(&backend));

    assert_eq!(h.engine.start_processing().await.unwrap(), CycleOutcome::CaptureFailed);
    assert_eq!(h.states(), vec![ListeningStart, Idle]);
    assert_eq!(backend.request_count(), 0);
    assert_eq!(capture.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn native_capture_records_audio_and_releases_microphone() {
    let mic = Arc::new(BurstMic::default());
    let backend = ScriptedBackend::new(vec![Ok(reply(json!({"textReply": "heard you"})))]);
    let h = harness_with(
        InteractionEngine::builder(config())
            .microphone(Arc::clone(&mic) as Arc<dyn Microphone>)
            .without_speech_to_text()
            .backend(Arc::clone(&backend) as Arc<dyn ProcessorBackend>),
    );

    h.engine.start_processing().await.unwrap();

    assert_eq!(mic.opens.load(Ordering::SeqCst), 1);
    assert_eq!(mic.releases.load(Ordering::SeqCst), 1);
    let requests = backend.requests.lock().unwrap();
    match &requests[0].input {
        CapturedInput::Audio(payload) => assert!(payload.bytes.starts_with(b"RIFF")),
        other => panic!("expected audio, got {:?}", other),
    }
}

#[tokio::test]
async fn denied_microphone_is_retried_then_reported() {
    let mic = Arc::new(BurstMic {
        fail: true,
        ..BurstMic::default()
    });
    let mut config = config();
    config.capture = CaptureConfig {
        max_attempts: 2,
        ..CaptureConfig::default()
    };
    let h = harness_with(
        InteractionEngine::builder(config)
            .microphone(Arc::clone(&mic) as Arc<dyn Microphone>)
            .without_speech_to_text()
            .backend(ScriptedBackend::new(vec![])),
    );

    assert_eq!(h.engine.start_processing().await.unwrap(), CycleOutcome::CaptureFailed);
    assert_eq!(mic.opens.load(Ordering::SeqCst), 2);
    assert_eq!(mic.releases.load(Ordering::SeqCst), 0);
    assert_eq!(h.states(), vec![ListeningStart, Idle]);
}

#[tokio::test]
async fn every_cycle_walks_a_valid_state_path() {
    let backend = ScriptedBackend::new(vec![
        Ok(reply(json!({"textReply": "one"}))),
        Err(denied(429)),
        Ok(ReplyData::default()),
        Ok(reply(json!({"textReply": "four", "shouldStreamAudioReply": true}))),
    ]);
    let h = harness(FixedCapture::heard("again"), backend);

    for _ in 0..4 {
        let before = h.states().len();
        h.engine.start_processing().await.unwrap();
        let cycle = h.states()[before..].to_vec();

        assert_eq!(cycle.first(), Some(&ListeningStart));
        assert!(cycle.last().unwrap().is_resting());
        let allowed: &[&[InteractionState]] = &[
            &[ListeningStart, Idle],
            &[ListeningStart, ThinkingStart, Idle],
            &[ListeningStart, ThinkingStart, Frozen],
            &[ListeningStart, ThinkingStart, SpeakingStart, Idle],
        ];
        assert!(allowed.contains(&cycle.as_slice()), "unexpected walk {:?}", cycle);
    }
}

#[tokio::test]
async fn unsubscribed_listener_stops_receiving() {
    let h = harness(
        FixedCapture::heard("x"),
        ScriptedBackend::new(vec![
            Ok(reply(json!({"textReply": "a"}))),
            Ok(reply(json!({"textReply": "b"}))),
        ]),
    );
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let listener = h.engine.on(STATE_CHANGE_EVENT, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    h.engine.start_processing().await.unwrap();
    h.engine.off(STATE_CHANGE_EVENT, &listener);
    h.engine.start_processing().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(h.states().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn cancelled_cycle_returns_to_idle_and_next_cycle_records() {
    let mic = Arc::new(LiveMic::default());
    let backend = ScriptedBackend::new(vec![Ok(reply(json!({"textReply": "second time lucky"})))]);
    let mut config = config();
    config.capture.recorder.max_duration_ms = 1000;
    let h = harness_with(
        InteractionEngine::builder(config)
            .microphone(Arc::clone(&mic) as Arc<dyn Microphone>)
            .without_speech_to_text()
            .backend(Arc::clone(&backend) as Arc<dyn ProcessorBackend>),
    );

    let cycle = h.engine.start_processing();
    let cancelled = tokio::time::timeout(Duration::from_millis(200), cycle).await;
    assert!(cancelled.is_err());
    assert_eq!(h.states(), vec![ListeningStart, Idle]);
    assert!(!h.engine.is_busy());
    assert_eq!(mic.releases.load(Ordering::SeqCst), 1);

    let outcome = h.engine.start_processing().await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    assert_eq!(mic.opens.load(Ordering::SeqCst), 2);
    assert_eq!(mic.releases.load(Ordering::SeqCst), 2);
    assert_eq!(backend.request_count(), 1);
    assert_eq!(
        h.states(),
        vec![ListeningStart, Idle, ListeningStart, ThinkingStart, Idle]
    );
}

#[tokio::test]
async fn stop_issued_as_speaking_starts_is_not_lost() {
    let backend = ScriptedBackend::new(vec![Ok(reply(json!({
        "textReply": "A very long answer.",
        "shouldStreamAudioReply": true
    })))]);
    let h = harness(FixedCapture::heard("tell me everything"), Arc::clone(&backend));
    let engine = Arc::new(h.engine);

    let weak = Arc::downgrade(&engine);
    engine.on(STATE_CHANGE_EVENT, move |state| {
        if *state == SpeakingStart {
            if let Some(engine) = weak.upgrade() {
                engine.stop_speaking();
            }
        }
    });

    let outcome = engine.start_processing().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            functions: None,
            playback: Some(PlaybackOutcome::Stopped)
        }
    );
    assert!(h.output.replies.lock().unwrap().is_empty());
    assert_eq!(
        *h.states.lock().unwrap(),
        vec![ListeningStart, ThinkingStart, SpeakingStart, Idle]
    );
}
