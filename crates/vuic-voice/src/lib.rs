//! # vuic-voice - voice interaction engine
//!
//! Captures a spoken command, sends it to the processor backend, then executes
//! the functions it names, shows its text and plays its spoken reply. Every
//! step is reported to listeners as an [`InteractionState`].
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      InteractionEngine                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │   Capture    │ → │  Processor   │ → │ FunctionRegistry   │  │
//! │  │ (cpal / STT) │   │ (HTTP/multi) │   │ text events        │  │
//! │  └──────────────┘   └──────────────┘   └────────────────────┘  │
//! │         ↑                                       ↓              │
//! │   start tone      StateBroadcaster      ┌────────────────────┐ │
//! │   (rodio)      Idle/Listening/Thinking/ │  ReplyPlayback     │ │
//! │                  Speaking/Frozen        │  (rodio, stream)   │ │
//! │                                         └────────────────────┘ │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod broadcaster;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod functions;
pub mod logging;
pub mod page;
pub mod playback;
pub mod state;
pub mod stt;
pub mod user;

pub use api::{
    HttpBackend, ProcessorBackend, ProcessorRequest, ReplyData, SdkMetadata, SDK_VERSION,
};
pub use broadcaster::{Listener, StateBroadcaster};
pub use capture::{
    AudioFormat, AudioPayload, AudioRecorder, CaptureMethod, CapturedInput, CpalMicrophone,
    FallbackCapture, InputCapture, Microphone, MicrophoneStream, RecognitionEvent,
    RecognitionEvents, RecognitionOptions, Recording, SpeechRecognizer, SpeechToTextCapture,
    StopReason, SttRecognizer,
};
pub use config::{CaptureConfig, EngineConfig, PlaybackConfig, RecorderConfig};
pub use engine::{
    CycleOutcome, EngineBuilder, InteractionEngine, INPUT_TRANSCRIPT_EVENT, TEXT_REPLY_EVENT,
};
pub use error::{ErrorClass, VoiceError, VoiceResult};
pub use functions::{
    ExecutionReport, FunctionArgs, FunctionCall, FunctionRegistry, FunctionSignature, VoiceFunction,
};
pub use page::{PageContent, PageContextProvider, StaticPageContext, TextKind};
pub use playback::{
    AudioOutput, AudioSession, ByteStream, OutputChannel, PlaybackOutcome, ReplyPlayback,
    ReplySource, ReplyStream, StopSignal,
};
pub use state::{InteractionState, STATE_CHANGE_EVENT};
pub use stt::{create_best_stt, FixedTranscript, OpenAiStt, SttBackend};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use user::{
    EndUser, FileIdentityStore, IdentityStore, MemoryIdentityStore, UserIdentity, END_USER_ID_KEY,
};
