//! Microphone access.
//!
//! [`Microphone::open`] acquires the input device and returns a
//! [`MicrophoneStream`] that yields mono f32 chunks. The stream owns the device:
//! `stop()` (or dropping it) releases it, and stopping twice is a no-op.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Source of microphone audio.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the input device and start delivering chunks.
    async fn open(&self) -> VoiceResult<MicrophoneStream>;
}

/// Live microphone capture. Exclusively owned by the capture invocation that opened it.
pub struct MicrophoneStream {
    sample_rate: u32,
    chunks: mpsc::UnboundedReceiver<Vec<f32>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MicrophoneStream {
    /// Wrap a chunk receiver. `release` runs exactly once, on the first `stop()` or on drop.
    pub fn new<F>(sample_rate: u32, chunks: mpsc::UnboundedReceiver<Vec<f32>>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            sample_rate,
            chunks,
            release: Some(Box::new(release)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Next chunk of mono samples; `None` once the device is gone or stopped.
    pub async fn next_chunk(&mut self) -> Option<Vec<f32>> {
        if self.release.is_none() {
            return None;
        }
        self.chunks.recv().await
    }

    /// Release the device. Safe to call any number of times.
    pub fn stop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            self.chunks.close();
            debug!("microphone released");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default input device via CPAL.
///
/// `cpal::Stream` is not `Send` on every platform, so each opened stream lives
/// on its own thread until the returned handle is stopped or dropped.
#[derive(Debug, Default, Clone)]
pub struct CpalMicrophone {
    /// Optional device name; `None` uses the host default input.
    pub device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::from_device_message(e.to_string()))?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }

    fn find_device(&self) -> VoiceResult<cpal::Device> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host
                .default_input_device()
                .ok_or_else(|| VoiceError::DeviceNotFound("No input device available".to_string())),
            Some(wanted) => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| VoiceError::from_device_message(e.to_string()))?;
                devices
                    .find(|d| d.name().map(|n| n == *wanted).unwrap_or(false))
                    .ok_or_else(|| {
                        VoiceError::DeviceNotFound(format!("No input device named '{}'", wanted))
                    })
            }
        }
    }

    /// Runs on the capture thread: build and start the stream, report back, then
    /// hold the stream until `release_rx` fires or its sender is dropped.
    fn run_capture_thread(
        &self,
        chunk_tx: mpsc::UnboundedSender<Vec<f32>>,
        ready_tx: oneshot::Sender<VoiceResult<u32>>,
        release_rx: std::sync::mpsc::Receiver<()>,
    ) {
        let started = (|| -> VoiceResult<(cpal::Stream, u32)> {
            let device = self.find_device()?;
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            info!("🎤 Using input device: {}", name);

            let default_config = device.default_input_config()?;
            let channels = default_config.channels().max(1) as usize;
            let sample_rate = default_config.sample_rate().0;
            let stream_config: cpal::StreamConfig = default_config.into();

            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Downmix interleaved frames to mono.
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect();
                    let _ = chunk_tx.send(mono);
                },
                move |err| {
                    warn!("Audio input stream error: {}", err);
                },
                None,
            )?;
            stream.play()?;
            Ok((stream, sample_rate))
        })();

        match started {
            Ok((stream, sample_rate)) => {
                if ready_tx.send(Ok(sample_rate)).is_err() {
                    return;
                }
                // Blocks until release; either a message or a dropped sender ends capture.
                let _ = release_rx.recv();
                drop(stream);
                debug!("cpal input stream dropped");
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        }
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn open(&self) -> VoiceResult<MicrophoneStream> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let mic = self.clone();
        thread::Builder::new()
            .name("vuic-mic".to_string())
            .spawn(move || mic.run_capture_thread(chunk_tx, ready_tx, release_rx))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| {
                VoiceError::AudioDevice("capture thread exited before start".to_string())
            })??;

        info!("✅ Audio capture started ({}Hz mono)", sample_rate);
        Ok(MicrophoneStream::new(sample_rate, chunk_rx, move || {
            let _ = release_tx.send(());
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = MicrophoneStream::new(16000, rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(vec![0.1; 4]).unwrap();
        assert_eq!(stream.next_chunk().await, Some(vec![0.1; 4]));

        stream.stop();
        stream.stop();
        assert!(stream.is_stopped());
        assert_eq!(stream.next_chunk().await, None);
        drop(stream);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_device() {
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let (_tx, rx) = mpsc::unbounded_channel();
        let stream = MicrophoneStream::new(16000, rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(stream);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        let result = CpalMicrophone::list_input_devices();
        if let Ok(devices) = result {
            println!("Available input devices: {:?}", devices);
        }
    }
}
