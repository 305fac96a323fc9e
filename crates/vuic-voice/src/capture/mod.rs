//! Input capture: turn the user's voice into something the processor understands.
//!
//! Two interchangeable strategies implement [`InputCapture`]:
//! - [`AudioRecorder`]: record from the microphone until silence or the hard cap,
//!   and hand over an encoded audio payload.
//! - [`SpeechToTextCapture`]: run a speech recognizer and hand over the transcript.
//!
//! [`FallbackCapture`] wraps an ordered list of strategies in a bounded retry loop.

pub mod fallback;
pub mod microphone;
pub mod recorder;
pub mod speech;

pub use fallback::FallbackCapture;
pub use microphone::{CpalMicrophone, Microphone, MicrophoneStream};
pub use recorder::{compute_rms, encode_wav, AudioRecorder, Recording, StopReason};
pub use speech::{
    RecognitionEvent, RecognitionEvents, RecognitionOptions, SpeechRecognizer, SpeechToTextCapture,
    SttRecognizer,
};

use crate::error::VoiceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which capture strategy produced (or should produce) the user's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    #[default]
    AudioRecording,
    SpeechToText,
}

impl CaptureMethod {
    pub fn alternate(&self) -> Self {
        match self {
            CaptureMethod::AudioRecording => CaptureMethod::SpeechToText,
            CaptureMethod::SpeechToText => CaptureMethod::AudioRecording,
        }
    }
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMethod::AudioRecording => write!(f, "audio_recording"),
            CaptureMethod::SpeechToText => write!(f, "speech_to_text"),
        }
    }
}

/// Container/codec of a recorded command, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Mp4,
    OggOpus,
    WebmOpus,
    Wav,
    Mpeg,
}

impl AudioFormat {
    /// Default preference: compressed containers first, WAV as the universal fallback.
    pub fn preference_list() -> Vec<AudioFormat> {
        vec![
            AudioFormat::Mp4,
            AudioFormat::OggOpus,
            AudioFormat::WebmOpus,
            AudioFormat::Wav,
            AudioFormat::Mpeg,
        ]
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp4 => "audio/mp4",
            AudioFormat::OggOpus => "audio/ogg; codecs=opus",
            AudioFormat::WebmOpus => "audio/webm; codecs=opus",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mpeg => "audio/mpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp4 => "mp4",
            AudioFormat::OggOpus => "ogg",
            AudioFormat::WebmOpus => "webm",
            AudioFormat::Wav => "wav",
            AudioFormat::Mpeg => "mp3",
        }
    }

    /// Whether this build can encode captured PCM into the format.
    pub fn is_encodable(&self) -> bool {
        matches!(self, AudioFormat::Wav)
    }
}

/// Encoded recording ready for upload.
#[derive(Debug, Clone)]
pub struct AudioPayload {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub duration: Duration,
}

/// What a capture strategy hands to the engine.
#[derive(Debug, Clone)]
pub enum CapturedInput {
    Audio(AudioPayload),
    Transcript(String),
}

impl CapturedInput {
    pub fn method(&self) -> CaptureMethod {
        match self {
            CapturedInput::Audio(_) => CaptureMethod::AudioRecording,
            CapturedInput::Transcript(_) => CaptureMethod::SpeechToText,
        }
    }
}

/// One way of obtaining the user's command.
#[async_trait]
pub trait InputCapture: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Capture one command. Any device acquired here is released before returning.
    async fn capture(&self) -> VoiceResult<CapturedInput>;

    /// End an in-progress capture early. Returns false (and does nothing) when idle.
    fn stop(&self) -> bool {
        false
    }
}
