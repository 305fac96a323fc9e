//! Audio-recording capture strategy.
//!
//! Records from a [`Microphone`] until one of three things happens: the RMS of
//! the most recent analysis window stays under the silence threshold for the
//! configured silence duration, the hard cap expires, or `stop_recording` is
//! called. All of them race inside one `select!`; whichever fires first ends the
//! recording and the rest are dropped, so a late timer can never stop twice.

use super::microphone::{Microphone, MicrophoneStream};
use super::{AudioFormat, AudioPayload, CapturedInput, InputCapture};
use crate::config::RecorderConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Why a recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Energy stayed under the threshold for the silence window.
    Silence,
    /// The hard cap expired.
    HardCap,
    /// `stop_recording` was called.
    Requested,
    /// The device stopped delivering audio.
    StreamEnded,
}

/// Raw PCM of one recording.
#[derive(Debug, Clone)]
pub struct Recording {
    /// Mono samples, -1.0..1.0.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub stop_reason: StopReason,
    /// Wall time from device open to stop.
    pub elapsed: Duration,
}

impl Recording {
    /// Duration represented by the captured samples.
    pub fn audio_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Stop handle of the recording in progress. `stop` is taken by the first stop request.
struct ActiveRecording {
    stop: Option<oneshot::Sender<()>>,
}

type ActiveSlot = Mutex<Option<ActiveRecording>>;

/// Marks the recorder busy for as long as it lives, including when the
/// recording future is dropped mid-await.
struct RecordingGuard<'a> {
    slot: &'a ActiveSlot,
}

impl Drop for RecordingGuard<'_> {
    fn drop(&mut self) {
        lock_slot(self.slot).take();
    }
}

fn lock_slot(slot: &ActiveSlot) -> std::sync::MutexGuard<'_, Option<ActiveRecording>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Records one command per `capture()` call.
pub struct AudioRecorder {
    microphone: Arc<dyn Microphone>,
    config: RecorderConfig,
    active: ActiveSlot,
}

impl AudioRecorder {
    pub fn new(microphone: Arc<dyn Microphone>, config: RecorderConfig) -> Self {
        Self {
            microphone,
            config,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// First format of the preference list this build can encode.
    pub fn select_format(&self) -> VoiceResult<AudioFormat> {
        self.config
            .formats
            .iter()
            .copied()
            .find(AudioFormat::is_encodable)
            .ok_or_else(|| {
                VoiceError::UnsupportedFormat(
                    self.config.formats.iter().map(|f| f.mime_type().to_string()).collect(),
                )
            })
    }

    pub fn is_recording(&self) -> bool {
        lock_slot(&self.active).is_some()
    }

    /// Stop the current recording early. No-op (returns false) when nothing is recording.
    pub fn stop_recording(&self) -> bool {
        let stop = lock_slot(&self.active).as_mut().and_then(|active| active.stop.take());
        match stop {
            Some(tx) => {
                debug!("stop requested for active recording");
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Record raw PCM. The microphone is released before this returns, on every path.
    pub async fn record_pcm(&self) -> VoiceResult<Recording> {
        let (_guard, stop_rx) = self.begin()?;
        let (recording, _) = self.record_inner(stop_rx, false).await?;
        Ok(recording)
    }

    /// Open the device first, then (optionally) pick the upload format, so an
    /// unsupported-format failure still exercises the release path.
    async fn record_inner(
        &self,
        stop_rx: oneshot::Receiver<()>,
        check_format: bool,
    ) -> VoiceResult<(Recording, Option<AudioFormat>)> {
        let started = Instant::now();
        let mut stream = self.microphone.open().await?;

        let format = if check_format {
            match self.select_format() {
                Ok(format) => {
                    info!("Recording audio file format: {}", format.mime_type());
                    Some(format)
                }
                Err(e) => {
                    stream.stop();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let (samples, stop_reason) = self.run_until_stopped(&mut stream, stop_rx, started).await;
        let sample_rate = stream.sample_rate();
        stream.stop();

        let recording = Recording {
            samples,
            sample_rate,
            stop_reason,
            elapsed: started.elapsed(),
        };
        info!(
            reason = ?recording.stop_reason,
            samples = recording.samples.len(),
            elapsed_ms = recording.elapsed.as_millis() as u64,
            "recording stopped"
        );
        Ok((recording, format))
    }

    fn begin(&self) -> VoiceResult<(RecordingGuard<'_>, oneshot::Receiver<()>)> {
        let mut slot = lock_slot(&self.active);
        if slot.is_some() {
            warn!("Recording is already in progress");
            return Err(VoiceError::RecordingInProgress);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(ActiveRecording { stop: Some(tx) });
        Ok((RecordingGuard { slot: &self.active }, rx))
    }

    async fn run_until_stopped(
        &self,
        stream: &mut MicrophoneStream,
        mut stop_rx: oneshot::Receiver<()>,
        started: Instant,
    ) -> (Vec<f32>, StopReason) {
        let threshold = self.config.silence_threshold;
        let silence_window = self.config.silence_duration();
        let window_len = self.config.analysis_window;

        let hard_cap = tokio::time::sleep_until(started + self.config.max_duration());
        tokio::pin!(hard_cap);
        let mut ticker = tokio::time::interval(self.config.analysis_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut samples: Vec<f32> = Vec::new();
        let mut silence_since = started;

        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut hard_cap => break StopReason::HardCap,
                _ = &mut stop_rx => break StopReason::Requested,
                chunk = stream.next_chunk() => match chunk {
                    Some(chunk) => samples.extend_from_slice(&chunk),
                    None => break StopReason::StreamEnded,
                },
                now = ticker.tick() => {
                    let window = &samples[samples.len().saturating_sub(window_len)..];
                    let rms = compute_rms(window);
                    if rms < threshold {
                        if now.duration_since(silence_since) >= silence_window {
                            break StopReason::Silence;
                        }
                    } else {
                        silence_since = now;
                    }
                }
            }
        };
        (samples, reason)
    }
}

#[async_trait]
impl InputCapture for AudioRecorder {
    fn name(&self) -> &str {
        "audio_recording"
    }

    async fn capture(&self) -> VoiceResult<CapturedInput> {
        let (guard, stop_rx) = self.begin()?;
        let result = self.record_inner(stop_rx, true).await;
        drop(guard);

        let (recording, format) = result?;
        let format = match format {
            Some(format) => format,
            None => self.select_format()?,
        };
        let duration = recording.audio_duration();
        let bytes = match format {
            AudioFormat::Wav => encode_wav(&recording.samples, recording.sample_rate)?,
            other => return Err(VoiceError::UnsupportedFormat(vec![other.mime_type().to_string()])),
        };
        Ok(CapturedInput::Audio(AudioPayload {
            bytes,
            format,
            sample_rate: recording.sample_rate,
            duration,
        }))
    }

    fn stop(&self) -> bool {
        self.stop_recording()
    }
}

/// Root mean square of f32 samples (-1.0..1.0). Returns 0.0 for empty input.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_of_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_of_squares / samples.len() as f64).sqrt() as f32
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for upload.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            let clamped = s.clamp(-1.0, 1.0);
            writer.write_sample((clamped * i16::MAX as f32).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
