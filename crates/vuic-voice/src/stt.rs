//! Speech-to-text backends used by the speech-to-text capture strategy.
//!
//! A backend turns one recorded utterance into text. [`OpenAiStt`] talks to any
//! OpenAI-compatible `/audio/transcriptions` endpoint; [`WhisperStt`] runs a
//! local ggml model when the `whisper` feature is enabled.

use crate::capture::{encode_wav, Recording};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Backend for converting recorded PCM to text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Transcribe one utterance; an empty string means nothing was recognized.
    async fn transcribe(
        &self,
        recording: &Recording,
        language: Option<&str>,
    ) -> VoiceResult<String>;

    fn name(&self) -> &str;
}

/// Always returns the same transcript. Handy for hosts without a recognizer and for tests.
#[derive(Debug, Clone, Default)]
pub struct FixedTranscript {
    pub text: String,
}

impl FixedTranscript {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl SttBackend for FixedTranscript {
    async fn transcribe(&self, _: &Recording, _: Option<&str>) -> VoiceResult<String> {
        Ok(self.text.clone())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper, OpenRouter, local servers).
/// Uses `STT_API_URL` (e.g. https://api.openai.com/v1), `STT_API_KEY`, and `STT_MODEL`
/// (default whisper-1).
#[derive(Clone)]
pub struct OpenAiStt {
    /// Base URL without trailing slash.
    pub base_url: String,
    api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiStt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiStt")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiStt {
    /// Build from environment: STT_API_URL, STT_API_KEY (or OPENAI_API_KEY), STT_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("STT requires STT_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl SttBackend for OpenAiStt {
    async fn transcribe(
        &self,
        recording: &Recording,
        language: Option<&str>,
    ) -> VoiceResult<String> {
        if recording.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(&recording.samples, recording.sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = language {
            // The API wants ISO-639-1 ("en"), not a locale tag ("en-US").
            let code = language.split(['-', '_']).next().unwrap_or(language);
            form = form.text("language", code.to_lowercase());
        }

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().await.map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        debug!(chars = text.len(), "transcription received");
        Ok(text)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Linear resampling of mono PCM.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::{Arc, Mutex};
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    const WHISPER_RATE: u32 = 16000;

    /// Local Whisper: loads a ggml model (e.g. ggml-base.en.bin) and runs inference on-device.
    /// Inference runs on the blocking pool.
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Arc<Mutex<whisper_rs::WhisperState>>,
    }

    impl WhisperStt {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Arc::new(Mutex::new(state)),
            })
        }

        /// `WHISPER_MODEL_PATH` must point to a .bin model file.
        pub fn from_env() -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path)
        }
    }

    fn run_inference(
        state: &Mutex<whisper_rs::WhisperState>,
        samples: &[f32],
        code: &str,
    ) -> VoiceResult<String> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_no_timestamps(true);
        params.set_language(Some(code));

        let mut state = state
            .lock()
            .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
        state
            .full(params, samples)
            .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
        Ok(state
            .as_iter()
            .filter_map(|seg| seg.to_str().ok().map(str::to_string))
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string())
    }

    #[async_trait]
    impl SttBackend for WhisperStt {
        async fn transcribe(
            &self,
            recording: &Recording,
            language: Option<&str>,
        ) -> VoiceResult<String> {
            if recording.samples.is_empty() {
                return Ok(String::new());
            }
            let samples = resample_linear(&recording.samples, recording.sample_rate, WHISPER_RATE);
            let code = language
                .and_then(|l| l.split(['-', '_']).next())
                .unwrap_or("en")
                .to_lowercase();
            let state = Arc::clone(&self.state);
            tokio::task::spawn_blocking(move || run_inference(&state, &samples, &code))
                .await
                .map_err(|e| VoiceError::Stt(format!("Whisper task failed: {}", e)))?
        }

        fn name(&self) -> &str {
            "whisper"
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Best available backend from the environment: local Whisper when
/// `WHISPER_MODEL_PATH` loads (`whisper` feature), else the HTTP API when a key
/// is set. `None` means speech-to-text capture is unavailable.
pub fn create_best_stt() -> Option<Box<dyn SttBackend>> {
    #[cfg(feature = "whisper")]
    {
        match whisper_stt::WhisperStt::from_env() {
            Ok(w) => return Some(Box::new(w)),
            Err(e) => debug!("local whisper unavailable: {}", e),
        }
    }
    match OpenAiStt::from_env() {
        Ok(open) => Some(Box::new(open)),
        Err(e) => {
            debug!("remote STT unavailable: {}", e);
            None
        }
    }
}
