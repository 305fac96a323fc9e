//! Reply playback: interface cues and the AI voice reply.
//!
//! All audio goes through one [`AudioSession`], opened lazily on first use and
//! kept for the life of the engine. Cues go to the `Cue` lane at tone volume and
//! never block. A reply goes to the `Reply` lane and [`ReplyPlayback::play_reply`]
//! resolves exactly once, when it finishes, is stopped, or fails.

pub mod output;
pub mod tones;

pub use output::{AudioOutput, OutputChannel, ReplyStream, RodioOutput};

use crate::config::PlaybackConfig;
use crate::error::{VoiceError, VoiceResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use once_cell::sync::OnceCell;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Progressive audio body.
pub type ByteStream = Pin<Box<dyn Stream<Item = VoiceResult<Bytes>> + Send>>;

/// Where the reply audio comes from.
pub enum ReplySource {
    /// Complete file, fetched then played in one go.
    Url(String),
    /// Chunks arriving over time, played as they decode.
    Stream(ByteStream),
}

impl fmt::Debug for ReplySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplySource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ReplySource::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Stopped,
    Failed,
}

type OutputOpener = Arc<dyn Fn() -> VoiceResult<Arc<dyn AudioOutput>> + Send + Sync>;

/// Observes `stop_current` calls made after the signal was taken.
pub struct StopSignal(watch::Receiver<u64>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        self.0.has_changed().unwrap_or(true)
    }
}

/// Lazily opened output device shared by cues and replies.
pub struct AudioSession {
    opener: OutputOpener,
    output: OnceCell<Arc<dyn AudioOutput>>,
}

impl AudioSession {
    pub fn new<F>(opener: F) -> Self
    where
        F: Fn() -> VoiceResult<Arc<dyn AudioOutput>> + Send + Sync + 'static,
    {
        Self {
            opener: Arc::new(opener),
            output: OnceCell::new(),
        }
    }

    /// Session on the default rodio device.
    pub fn native() -> Self {
        Self::new(|| Ok(Arc::new(RodioOutput::open()?) as Arc<dyn AudioOutput>))
    }

    /// Open the device if it is not open yet. A failed open is retried on the next call.
    ///
    /// Opening blocks on the device thread, so it runs on the blocking pool.
    pub async fn unlock(&self) -> VoiceResult<Arc<dyn AudioOutput>> {
        if let Some(output) = self.output.get() {
            return Ok(Arc::clone(output));
        }
        let opener = Arc::clone(&self.opener);
        let opened = tokio::task::spawn_blocking(move || opener())
            .await
            .map_err(|e| VoiceError::Playback(format!("audio open task failed: {}", e)))??;
        Ok(Arc::clone(self.output.get_or_init(|| opened)))
    }

    /// The device, if already open.
    pub fn opened(&self) -> Option<Arc<dyn AudioOutput>> {
        self.output.get().map(Arc::clone)
    }

    pub fn is_unlocked(&self) -> bool {
        self.output.get().is_some()
    }
}

pub struct ReplyPlayback {
    session: AudioSession,
    config: PlaybackConfig,
    http: reqwest::Client,
    start_tone: Vec<u8>,
    end_tone: Vec<u8>,
    stop_generation: watch::Sender<u64>,
}

impl ReplyPlayback {
    pub fn new(session: AudioSession, config: PlaybackConfig) -> VoiceResult<Self> {
        let start_tone =
            tones::load_or_generate(config.start_tone_path.as_deref(), tones::start_tone)?;
        let end_tone = tones::load_or_generate(config.end_tone_path.as_deref(), tones::end_tone)?;
        let (stop_generation, _) = watch::channel(0);
        Ok(Self {
            session,
            config,
            http: reqwest::Client::new(),
            start_tone,
            end_tone,
            stop_generation,
        })
    }

    /// Use a shared HTTP client for fetching reply URLs.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn session(&self) -> &AudioSession {
        &self.session
    }

    pub fn play_start_tone(&self) {
        self.play_cue(&self.start_tone, "start");
    }

    pub fn play_end_tone(&self) {
        self.play_cue(&self.end_tone, "end");
    }

    /// Cues never wait for the device; before the session is unlocked they are skipped.
    fn play_cue(&self, tone: &[u8], which: &str) {
        let Some(output) = self.session.opened() else {
            debug!("audio session not open; skipping {} tone", which);
            return;
        };
        if let Err(e) = output.enqueue(OutputChannel::Cue, tone.to_vec(), self.config.tone_volume) {
            warn!("could not play {} tone: {}", which, e);
        }
    }

    /// Halt the reply in progress, if any. Cues are unaffected.
    pub fn stop_current(&self) {
        self.stop_generation.send_modify(|g| *g += 1);
        if let Some(output) = self.session.output.get() {
            output.stop(OutputChannel::Reply);
        }
    }

    /// Signal for a reply about to start. Take it before announcing the reply so
    /// a stop issued in between is not lost.
    pub fn stop_signal(&self) -> StopSignal {
        let mut rx = self.stop_generation.subscribe();
        rx.borrow_and_update();
        StopSignal(rx)
    }

    /// Play a reply to the end. Resolves once, with how it ended.
    pub async fn play_reply(&self, source: ReplySource) -> PlaybackOutcome {
        self.play_reply_until(source, self.stop_signal()).await
    }

    /// Like [`play_reply`](Self::play_reply), honoring every stop since `stop` was taken.
    pub async fn play_reply_until(&self, source: ReplySource, stop: StopSignal) -> PlaybackOutcome {
        if stop.is_stopped() {
            info!("reply stopped before playback began");
            return PlaybackOutcome::Stopped;
        }
        let StopSignal(mut stop_rx) = stop;

        let output = match self.session.unlock().await {
            Ok(output) => output,
            Err(e) => {
                warn!("audio output unavailable: {}", e);
                return PlaybackOutcome::Failed;
            }
        };

        let queued = match source {
            ReplySource::Url(url) => self.queue_url(&*output, &url, &mut stop_rx).await,
            ReplySource::Stream(stream) => self.queue_stream(&*output, stream, &mut stop_rx).await,
        };
        match queued {
            Ok(()) => self.drain(&*output, &mut stop_rx).await,
            Err(outcome) => outcome,
        }
    }

    async fn queue_url(
        &self,
        output: &dyn AudioOutput,
        url: &str,
        stop_rx: &mut watch::Receiver<u64>,
    ) -> Result<(), PlaybackOutcome> {
        info!("Playing reply audio from {}", url);
        let fetch = async {
            let response = self.http.get(url).send().await?.error_for_status()?;
            response.bytes().await
        };
        let bytes = tokio::select! {
            biased;
            _ = stop_rx.changed() => return Err(PlaybackOutcome::Stopped),
            fetched = fetch => match fetched {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("could not fetch reply audio: {}", e);
                    return Err(PlaybackOutcome::Failed);
                }
            },
        };

        output
            .enqueue(OutputChannel::Reply, bytes.to_vec(), self.config.reply_volume)
            .map_err(|e| {
                warn!("could not decode reply audio: {}", e);
                PlaybackOutcome::Failed
            })
    }

    async fn queue_stream(
        &self,
        output: &dyn AudioOutput,
        mut stream: ByteStream,
        stop_rx: &mut watch::Receiver<u64>,
    ) -> Result<(), PlaybackOutcome> {
        let segment_bytes = self.config.stream_segment_bytes.max(1);
        let mut reply = output
            .begin_stream(OutputChannel::Reply, self.config.reply_volume)
            .map_err(|e| {
                warn!("could not start reply stream: {}", e);
                PlaybackOutcome::Failed
            })?;
        let mut pending: Vec<u8> = Vec::new();
        let mut received = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    output.stop(OutputChannel::Reply);
                    return Err(PlaybackOutcome::Stopped);
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    received += chunk.len();
                    pending.extend_from_slice(&chunk);
                    if pending.len() >= segment_bytes {
                        reply.push(std::mem::take(&mut pending)).map_err(|e| {
                            warn!("reply audio is not playable: {}", e);
                            output.stop(OutputChannel::Reply);
                            PlaybackOutcome::Failed
                        })?;
                    }
                }
                Some(Err(e)) => {
                    warn!("reply audio stream failed: {}", e);
                    output.stop(OutputChannel::Reply);
                    return Err(PlaybackOutcome::Failed);
                }
                None => break,
            }
        }

        let finished = if pending.is_empty() {
            Ok(())
        } else {
            reply.push(pending)
        };
        finished.and_then(|()| reply.finish()).map_err(|e| {
            warn!("could not decode reply audio stream: {}", e);
            PlaybackOutcome::Failed
        })?;
        info!(bytes = received, "reply audio stream finished");
        Ok(())
    }

    async fn drain(
        &self,
        output: &dyn AudioOutput,
        stop_rx: &mut watch::Receiver<u64>,
    ) -> PlaybackOutcome {
        let poll = self.config.drain_poll();
        loop {
            // A stop silences the output before the poll can see it, so check the stop first.
            if stop_rx.has_changed().unwrap_or(true) {
                return PlaybackOutcome::Stopped;
            }
            if !output.is_playing(OutputChannel::Reply) {
                return PlaybackOutcome::Completed;
            }
            tokio::select! {
                biased;
                _ = stop_rx.changed() => return PlaybackOutcome::Stopped,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
