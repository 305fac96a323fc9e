//! Error types for the vuic voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Coarse classification used by the engine to decide how an error is surfaced.
///
/// Only [`ErrorClass::Configuration`] reaches the caller of
/// `InteractionEngine::start_processing`; every other class ends the cycle in
/// `Idle` (or `Frozen`) and is reported through logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Device,
    Transport,
    Protocol,
    Handler,
    Playback,
}

/// Errors that can occur in the voice interaction engine
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Missing API key: pass a non-empty key when initializing the engine")]
    MissingApiKey,

    #[error(
        "No voice functions registered: call register_functions before starting an interaction"
    )]
    EmptyRegistry,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("No audio input device found: {0}")]
    DeviceNotFound(String),

    #[error("No supported audio format in preference list {0:?}")]
    UnsupportedFormat(Vec<String>),

    #[error("A recording is already in progress")]
    RecordingInProgress,

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("Input capture failed after {attempts} attempt(s): {last_error}")]
    InputCaptureExhausted { attempts: usize, last_error: String },

    #[error("STT error: {0}")]
    Stt(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend returned status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Voice function '{name}' failed: {reason}")]
    Handler { name: String, reason: String },

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VoiceError::MissingApiKey | VoiceError::EmptyRegistry | VoiceError::Config(_) => {
                ErrorClass::Configuration
            }
            VoiceError::PermissionDenied(_)
            | VoiceError::DeviceNotFound(_)
            | VoiceError::UnsupportedFormat(_)
            | VoiceError::RecordingInProgress
            | VoiceError::AudioDevice(_)
            | VoiceError::AudioStream(_)
            | VoiceError::Recognition(_)
            | VoiceError::InputCaptureExhausted { .. }
            | VoiceError::Stt(_)
            | VoiceError::Io(_) => ErrorClass::Device,
            VoiceError::Transport(_) | VoiceError::Http { .. } => ErrorClass::Transport,
            VoiceError::Protocol(_) => ErrorClass::Protocol,
            VoiceError::Handler { .. } => ErrorClass::Handler,
            VoiceError::Playback(_) => ErrorClass::Playback,
        }
    }

    /// True for backend answers that mean "stop trying": unauthorized, forbidden, rate limited.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, VoiceError::Http { status: 401 | 403 | 429, .. })
    }

    /// Map a platform device message onto the permission / missing-device variants.
    pub(crate) fn from_device_message(message: String) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("permission")
            || lower.contains("denied")
            || lower.contains("not allowed")
        {
            VoiceError::PermissionDenied(message)
        } else if lower.contains("no such device")
            || lower.contains("not available")
            || lower.contains("not found")
        {
            VoiceError::DeviceNotFound(message)
        } else {
            VoiceError::AudioDevice(message)
        }
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                VoiceError::DeviceNotFound(err.to_string())
            }
            other => VoiceError::from_device_message(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceNotFound(err.to_string())
            }
            cpal::BuildStreamError::BackendSpecific { .. } => {
                VoiceError::from_device_message(err.to_string())
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => {
                VoiceError::DeviceNotFound(err.to_string())
            }
            other => VoiceError::from_device_message(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => VoiceError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => VoiceError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::AudioStream(format!("WAV encoding failed: {}", err))
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
