//! Engine configuration.
//!
//! Hosts normally build an [`EngineConfig`] in code with [`EngineConfig::new`]
//! and the setters. [`EngineConfig::load`] layers the same structure from a TOML
//! file and `VUIC__*` environment variables.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | VUIC_CONFIG | config/vuic.toml | Optional TOML file. |
//! | VUIC__API_KEY | (none) | Processor API key (required). |
//! | VUIC__API_URL | https://api.sista.ai | Processor base URL. |
//! | VUIC__USER_ID | (none) | Developer-supplied end-user id. |
//! | VUIC__DEBUG | false | Verbose payload logging. |
//! | VUIC__CAPTURE__PRIMARY | audio_recording | First capture strategy. |
//! | VUIC__CAPTURE__RECORDER__MAX_DURATION_MS | 10000 | Hard recording cap. |

use crate::capture::{AudioFormat, CaptureMethod};
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.sista.ai";

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Top-level configuration for [`crate::InteractionEngine`].
#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Processor API key, sent as `x-api-key`.
    #[serde(default)]
    pub api_key: String,
    /// Processor base URL without trailing slash.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Developer-supplied end-user id, forwarded as `providedEndUserId`.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Attach the host's page-content snapshot to every request.
    #[serde(default = "default_true")]
    pub scrape_content: bool,
    /// Log request/response payloads at debug level.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Directory for the persisted end-user identity.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

impl EngineConfig {
    /// Config with defaults and the given key. Fails with `MissingApiKey` if the key is blank.
    pub fn new(api_key: impl Into<String>) -> VoiceResult<Self> {
        let config = Self {
            api_key: api_key.into(),
            api_url: default_api_url(),
            user_id: None,
            scrape_content: true,
            debug: false,
            request_timeout_secs: default_request_timeout_secs(),
            data_dir: default_data_dir(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_scrape_content(mut self, scrape_content: bool) -> Self {
        self.scrape_content = scrape_content;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Load from `VUIC_CONFIG` (default `config/vuic.toml`, optional) and `VUIC__*` env.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("VUIC_CONFIG").unwrap_or_else(|_| "config/vuic.toml".to_string());
        Self::load_from_path(Path::new(&path))
    }

    pub fn load_from_path(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .set_default("api_url", DEFAULT_API_URL)?
            .set_default("scrape_content", true)?
            .set_default("debug", false)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("VUIC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(VoiceError::MissingApiKey);
        }
        if self.api_url.trim().is_empty() {
            return Err(VoiceError::Config("api_url must not be empty".to_string()));
        }
        self.capture.recorder.validate()
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Last 8 characters of the key, for logs.
    pub fn redacted_key(&self) -> String {
        let key = self.api_key.trim();
        let skip = key.chars().count().saturating_sub(8);
        let tail: String = key.chars().skip(skip).collect();
        format!("...{}", tail)
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("api_key", &self.redacted_key())
            .field("api_url", &self.api_url)
            .field("user_id", &self.user_id)
            .field("scrape_content", &self.scrape_content)
            .field("debug", &self.debug)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("data_dir", &self.data_dir)
            .field("capture", &self.capture)
            .field("playback", &self.playback)
            .finish()
    }
}

fn default_max_attempts() -> usize {
    3
}

/// How a spoken command is captured, and how hard to retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Strategy tried first; the other one is the fallback.
    #[serde(default)]
    pub primary: CaptureMethod,
    /// Total attempts across strategies. Clamped to 2..=3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Recognition language (BCP 47). `None` lets the recognizer decide.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub recorder: RecorderConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            primary: CaptureMethod::default(),
            max_attempts: default_max_attempts(),
            language: None,
            recorder: RecorderConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn attempts(&self) -> usize {
        self.max_attempts.clamp(2, 3)
    }
}

fn default_max_duration_ms() -> u64 {
    10_000
}

fn default_silence_duration_ms() -> u64 {
    1_300
}

fn default_silence_threshold() -> f32 {
    0.008
}

fn default_analysis_window() -> usize {
    2048
}

fn default_analysis_interval_ms() -> u64 {
    50
}

/// Recording limits and silence detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Hard cap: recording always stops after this long.
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    /// Stop early once RMS stays below `silence_threshold` this long.
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u64,
    /// Normalized RMS (0.0..1.0) under which a window counts as silence.
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,
    /// Samples per analysis window (most recent samples).
    #[serde(default = "default_analysis_window")]
    pub analysis_window: usize,
    #[serde(default = "default_analysis_interval_ms")]
    pub analysis_interval_ms: u64,
    /// Encoding preference, first supported wins.
    #[serde(default = "AudioFormat::preference_list")]
    pub formats: Vec<AudioFormat>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: default_max_duration_ms(),
            silence_duration_ms: default_silence_duration_ms(),
            silence_threshold: default_silence_threshold(),
            analysis_window: default_analysis_window(),
            analysis_interval_ms: default_analysis_interval_ms(),
            formats: AudioFormat::preference_list(),
        }
    }
}

impl RecorderConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms.max(1))
    }

    fn validate(&self) -> VoiceResult<()> {
        if self.max_duration_ms == 0 {
            return Err(VoiceError::Config(
                "capture.recorder.max_duration_ms must be greater than zero".to_string(),
            ));
        }
        if self.analysis_window == 0 {
            return Err(VoiceError::Config(
                "capture.recorder.analysis_window must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.silence_threshold) {
            return Err(VoiceError::Config(format!(
                "capture.recorder.silence_threshold must be within 0.0..=1.0, got {}",
                self.silence_threshold
            )));
        }
        Ok(())
    }
}

fn default_tone_volume() -> f32 {
    0.25
}

fn default_reply_volume() -> f32 {
    1.0
}

fn default_stream_segment_bytes() -> usize {
    32 * 1024
}

fn default_drain_poll_ms() -> u64 {
    50
}

/// Cue tones and reply playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_tone_volume")]
    pub tone_volume: f32,
    #[serde(default = "default_reply_volume")]
    pub reply_volume: f32,
    /// WAV/MP3 file replacing the generated start cue.
    #[serde(default)]
    pub start_tone_path: Option<PathBuf>,
    /// WAV/MP3 file replacing the generated end cue.
    #[serde(default)]
    pub end_tone_path: Option<PathBuf>,
    /// Streamed replies are decoded in segments of at least this many bytes.
    #[serde(default = "default_stream_segment_bytes")]
    pub stream_segment_bytes: usize,
    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tone_volume: default_tone_volume(),
            reply_volume: default_reply_volume(),
            start_tone_path: None,
            end_tone_path: None,
            stream_segment_bytes: default_stream_segment_bytes(),
            drain_poll_ms: default_drain_poll_ms(),
        }
    }
}

impl PlaybackConfig {
    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms.max(1))
    }
}
