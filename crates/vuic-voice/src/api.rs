//! HTTP exchange with the processor backend.
//!
//! `POST {api_url}/processor/run` carries the command (audio file or text) plus
//! context as multipart form data; `POST {api_url}/processor/audio-stream`
//! returns the spoken reply as a byte stream.

use crate::capture::CapturedInput;
use crate::config::EngineConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::functions::{FunctionCall, FunctionSignature};
use crate::page::PageContent;
use crate::playback::ByteStream;
use crate::user::EndUser;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const RUN_PATH: &str = "/processor/run";
const AUDIO_STREAM_PATH: &str = "/processor/audio-stream";
const API_KEY_HEADER: &str = "x-api-key";

/// Describes this client to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdkMetadata {
    pub sdk: String,
    pub version: String,
    pub platform: String,
    pub arch: String,
}

impl Default for SdkMetadata {
    fn default() -> Self {
        Self {
            sdk: "vuic-voice".to_string(),
            version: SDK_VERSION.to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Everything sent for one interaction.
#[derive(Debug, Clone)]
pub struct ProcessorRequest {
    pub sdk_version: String,
    pub sdk_metadata: SdkMetadata,
    pub end_user: EndUser,
    pub signatures: Vec<FunctionSignature>,
    pub input: CapturedInput,
    pub page_content: Option<PageContent>,
}

/// Envelope returned by `/processor/run`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorResponse {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: ReplyData,
}

/// What the processor wants done with the command.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyData {
    #[serde(default, alias = "inputVoiceCommandAsText")]
    pub input_transcript: Option<String>,
    #[serde(default, alias = "outputTextReply")]
    pub text_reply: Option<String>,
    #[serde(default, alias = "outputExecutableFunctions", deserialize_with = "deserialize_calls")]
    pub executable_functions: Vec<FunctionCall>,
    #[serde(default, alias = "outputAudioReply")]
    pub audio_url_reply: Option<String>,
    #[serde(default)]
    pub should_stream_audio_reply: Option<bool>,
}

impl ReplyData {
    pub fn transcript(&self) -> Option<&str> {
        non_blank(&self.input_transcript)
    }

    pub fn text(&self) -> Option<&str> {
        non_blank(&self.text_reply)
    }

    pub fn audio_url(&self) -> Option<&str> {
        non_blank(&self.audio_url_reply)
    }

    /// Streaming needs the text to speak.
    pub fn wants_stream(&self) -> bool {
        self.should_stream_audio_reply.unwrap_or(false) && self.text().is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_url().is_some() || self.wants_stream()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts a flat list of calls, OpenAI-style `{ function: { name, arguments } }`
/// items, or either wrapped as `{ functions: [...] }`, `{ tool_calls: [...] }` or
/// `{ message: { tool_calls: [...] } }`. Items without a name are dropped.
fn deserialize_calls<'de, D>(deserializer: D) -> Result<Vec<FunctionCall>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_calls(value))
}

fn normalize_calls(value: Value) -> Vec<FunctionCall> {
    match value {
        Value::Array(items) => items.into_iter().filter_map(normalize_call).collect(),
        Value::Object(mut map) => {
            for key in ["functions", "tool_calls", "message"] {
                if let Some(inner) = map.remove(key) {
                    return normalize_calls(inner);
                }
            }
            normalize_call(Value::Object(map)).into_iter().collect()
        }
        Value::Null => Vec::new(),
        other => {
            warn!("ignoring malformed executable functions: {}", other);
            Vec::new()
        }
    }
}

fn normalize_call(item: Value) -> Option<FunctionCall> {
    let mut map = match item {
        Value::Object(map) => map,
        other => {
            warn!("ignoring malformed function call: {}", other);
            return None;
        }
    };
    let id = map.get("id").and_then(Value::as_str).map(str::to_string);
    let (name, args) = match map.remove("function") {
        Some(Value::Object(mut function)) => (
            function.remove("name"),
            function.remove("arguments").or_else(|| function.remove("args")),
        ),
        _ => (map.remove("name"), map.remove("args").or_else(|| map.remove("arguments"))),
    };
    match name {
        Some(Value::String(name)) if !name.is_empty() => Some(FunctionCall {
            name,
            args: args.unwrap_or(Value::Null),
            id,
        }),
        _ => {
            warn!("ignoring function call without a name");
            None
        }
    }
}

/// Body code wins, except that an HTTP error is never downgraded by a body claiming success.
pub fn effective_status(http_status: u16, body_status: Option<u16>) -> u16 {
    match body_status {
        Some(code) if http_status >= 400 && code < 400 => http_status,
        Some(code) => code,
        None => http_status,
    }
}

/// Turn a raw `/processor/run` response into reply data or a classified error.
pub fn interpret_response(http_status: u16, body: &[u8]) -> VoiceResult<ReplyData> {
    match serde_json::from_slice::<ProcessorResponse>(body) {
        Ok(parsed) => {
            let status = effective_status(http_status, parsed.status_code);
            if status >= 400 {
                return Err(VoiceError::Http {
                    status,
                    message: parsed.message.unwrap_or_default(),
                });
            }
            Ok(parsed.data)
        }
        Err(e) if http_status >= 400 => {
            debug!("error body is not JSON: {}", e);
            Err(VoiceError::Http {
                status: http_status,
                message: String::from_utf8_lossy(&body[..body.len().min(256)]).into_owned(),
            })
        }
        Err(e) => Err(VoiceError::Protocol(format!("invalid response body: {}", e))),
    }
}

/// The processor service.
#[async_trait]
pub trait ProcessorBackend: Send + Sync {
    /// Send one command and return the classified reply.
    async fn run(&self, request: &ProcessorRequest) -> VoiceResult<ReplyData>;

    /// Ask the processor to speak `text`; the body arrives progressively.
    async fn audio_stream(&self, text: &str) -> VoiceResult<ByteStream>;
}

/// reqwest implementation of [`ProcessorBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    debug: bool,
}

impl HttpBackend {
    pub fn new(config: &EngineConfig) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
            api_key: config.api_key.clone(),
            debug: config.debug,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn build_form(&self, request: &ProcessorRequest) -> VoiceResult<Form> {
        let mut form = Form::new()
            .text("sdkVersion", request.sdk_version.clone())
            .text("sdkMetadata", serde_json::to_string(&request.sdk_metadata)?)
            .text("endUser", serde_json::to_string(&request.end_user)?)
            .text("functionsSignatures", serde_json::to_string(&request.signatures)?);

        form = match &request.input {
            CapturedInput::Audio(payload) => {
                let part = Part::bytes(payload.bytes.clone())
                    .file_name(format!("command.{}", payload.format.extension()))
                    .mime_str(payload.format.mime_type())?;
                form.part("audio", part)
            }
            CapturedInput::Transcript(text) => form.text("text", text.clone()),
        };

        if let Some(page) = &request.page_content {
            form = form.text("pageContent", serde_json::to_string(page)?);
        }
        Ok(form)
    }
}

#[async_trait]
impl ProcessorBackend for HttpBackend {
    async fn run(&self, request: &ProcessorRequest) -> VoiceResult<ReplyData> {
        let form = self.build_form(request)?;
        if self.debug {
            debug!(
                input = ?request.input.method(),
                functions = request.signatures.len(),
                page_content = request.page_content.is_some(),
                "sending processor request"
            );
        }

        let response = self
            .client
            .post(self.url(RUN_PATH))
            .header(API_KEY_HEADER, &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))?;

        let http_status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))?;
        if self.debug {
            let body = String::from_utf8_lossy(&body);
            debug!(status = http_status, body = %body, "processor response");
        }
        interpret_response(http_status, &body)
    }

    async fn audio_stream(&self, text: &str) -> VoiceResult<ByteStream> {
        info!(chars = text.len(), "requesting streamed audio reply");
        let response = self
            .client
            .post(self.url(AUDIO_STREAM_PATH))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&serde_json::json!({ "textMessage": text }))
            .send()
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VoiceError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| VoiceError::Transport(e.to_string()))),
        ))
    }
}
