//! Speech-to-text capture strategy.
//!
//! A [`SpeechRecognizer`] produces a stream of [`RecognitionEvent`]s for one
//! utterance. [`SpeechToTextCapture`] keeps only the final fragments, joins them
//! with single spaces, and resolves when the recognizer signals the end.

use super::recorder::AudioRecorder;
use super::{CapturedInput, InputCapture};
use crate::error::{VoiceError, VoiceResult};
use crate::stt::SttBackend;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// A recognized fragment. Interim fragments have `is_final == false`.
    Result { transcript: String, is_final: bool },
    Error(String),
    /// End of the utterance.
    End,
}

/// Events of one utterance, in order.
pub type RecognitionEvents = mpsc::UnboundedReceiver<RecognitionEvent>;

#[derive(Debug, Clone, Default)]
pub struct RecognitionOptions {
    pub continuous: bool,
    pub interim_results: bool,
    /// BCP-47 tag such as `en-US`. `None` lets the recognizer decide.
    pub language: Option<String>,
}

/// A speech recognition engine.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Begin recognizing one utterance. Events arrive on the returned channel;
    /// the channel closing is treated like `End`.
    async fn start(&self, options: &RecognitionOptions) -> VoiceResult<RecognitionEvents>;

    /// Stop listening early. Already recognized fragments are still delivered.
    fn abort(&self) -> bool {
        false
    }
}

pub struct SpeechToTextCapture {
    recognizer: Arc<dyn SpeechRecognizer>,
    options: RecognitionOptions,
}

impl SpeechToTextCapture {
    /// Single-utterance, final-results-only recognition.
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, language: Option<String>) -> Self {
        Self {
            recognizer,
            options: RecognitionOptions {
                continuous: false,
                interim_results: false,
                language,
            },
        }
    }

    pub fn options(&self) -> &RecognitionOptions {
        &self.options
    }
}

#[async_trait]
impl InputCapture for SpeechToTextCapture {
    fn name(&self) -> &str {
        "speech_to_text"
    }

    async fn capture(&self) -> VoiceResult<CapturedInput> {
        let mut events = self.recognizer.start(&self.options).await?;
        info!("Speech recognition started");

        let mut fragments: Vec<String> = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                RecognitionEvent::Result { transcript, is_final } => {
                    if !is_final {
                        continue;
                    }
                    let fragment = transcript.trim();
                    if !fragment.is_empty() {
                        fragments.push(fragment.to_string());
                    }
                }
                RecognitionEvent::Error(reason) => {
                    warn!("Speech recognition error: {}", reason);
                    return Err(VoiceError::Recognition(reason));
                }
                RecognitionEvent::End => break,
            }
        }

        let transcript = fragments.join(" ");
        debug!(transcript = %transcript, "speech recognition ended");
        Ok(CapturedInput::Transcript(transcript))
    }

    fn stop(&self) -> bool {
        self.recognizer.abort()
    }
}

/// Recognizer that records one utterance with silence detection and hands the
/// PCM to an [`SttBackend`].
#[derive(Clone)]
pub struct SttRecognizer {
    recorder: Arc<AudioRecorder>,
    backend: Arc<dyn SttBackend>,
}

impl SttRecognizer {
    pub fn new(recorder: AudioRecorder, backend: Arc<dyn SttBackend>) -> Self {
        Self {
            recorder: Arc::new(recorder),
            backend,
        }
    }
}

#[async_trait]
impl SpeechRecognizer for SttRecognizer {
    async fn start(&self, options: &RecognitionOptions) -> VoiceResult<RecognitionEvents> {
        if self.recorder.is_recording() {
            return Err(VoiceError::RecordingInProgress);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::clone(&self.recorder);
        let backend = Arc::clone(&self.backend);
        let language = options.language.clone();
        let listener = tx.clone();

        let work = async move {
            let recording = match recorder.record_pcm().await {
                Ok(recording) => recording,
                Err(e) => {
                    let _ = tx.send(RecognitionEvent::Error(e.to_string()));
                    return;
                }
            };
            debug!(
                backend = backend.name(),
                samples = recording.samples.len(),
                "transcribing utterance"
            );
            match backend.transcribe(&recording, language.as_deref()).await {
                Ok(text) => {
                    if !text.is_empty() {
                        let _ = tx.send(RecognitionEvent::Result {
                            transcript: text,
                            is_final: true,
                        });
                    }
                    let _ = tx.send(RecognitionEvent::End);
                }
                Err(e) => {
                    let _ = tx.send(RecognitionEvent::Error(e.to_string()));
                }
            }
        };
        // Nobody is waiting once the receiver is gone; dropping `work` releases the microphone.
        tokio::spawn(async move {
            tokio::select! {
                _ = listener.closed() => debug!("speech capture abandoned; recognition cancelled"),
                _ = work => {}
            }
        });
        Ok(rx)
    }

    fn abort(&self) -> bool {
        self.recorder.stop_recording()
    }
}
