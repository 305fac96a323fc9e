//! Output device abstraction and the rodio implementation.

use crate::error::{VoiceError, VoiceResult};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, info, warn};

/// Independent playback lanes sharing one device. Cues never cut off a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputChannel {
    Cue,
    Reply,
}

/// Encoded audio fed in pieces as it arrives.
pub trait ReplyStream: Send {
    /// Append the next encoded bytes. `Err` means the audio can no longer play.
    fn push(&mut self, bytes: Vec<u8>) -> VoiceResult<()>;

    /// No more bytes will follow. `Err` means nothing playable was queued.
    fn finish(self: Box<Self>) -> VoiceResult<()>;
}

/// An opened audio output device.
pub trait AudioOutput: Send + Sync {
    /// Decode encoded audio (WAV/MP3/...) and queue it on `channel` at `volume`.
    /// A decode failure is returned and nothing is queued.
    fn enqueue(&self, channel: OutputChannel, bytes: Vec<u8>, volume: f32) -> VoiceResult<()>;

    /// Whether `channel` still has queued or playing audio.
    fn is_playing(&self, channel: OutputChannel) -> bool;

    /// Drop everything queued on `channel` and fall silent.
    fn stop(&self, channel: OutputChannel);

    /// Start a progressive reply on `channel`.
    ///
    /// The default queues each pushed piece through [`enqueue`](Self::enqueue),
    /// carrying undecodable bytes over into the next piece.
    fn begin_stream(
        &self,
        channel: OutputChannel,
        volume: f32,
    ) -> VoiceResult<Box<dyn ReplyStream + '_>> {
        Ok(Box::new(SegmentedStream {
            output: self,
            channel,
            volume,
            pending: Vec::new(),
            queued: 0,
        }))
    }
}

struct SegmentedStream<'a, O: AudioOutput + ?Sized> {
    output: &'a O,
    channel: OutputChannel,
    volume: f32,
    pending: Vec<u8>,
    queued: usize,
}

impl<O: AudioOutput + ?Sized> ReplyStream for SegmentedStream<'_, O> {
    fn push(&mut self, bytes: Vec<u8>) -> VoiceResult<()> {
        self.pending.extend_from_slice(&bytes);
        match self.output.enqueue(self.channel, self.pending.clone(), self.volume) {
            Ok(()) => {
                self.queued += 1;
                debug!(segment = self.queued, bytes = self.pending.len(), "queued reply segment");
                self.pending.clear();
            }
            // Not decodable yet; keep accumulating.
            Err(e) => debug!(bytes = self.pending.len(), "segment not decodable yet: {}", e),
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> VoiceResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        match self.output.enqueue(self.channel, self.pending, self.volume) {
            Ok(()) => Ok(()),
            Err(e) if self.queued == 0 => Err(e),
            Err(e) => {
                warn!("could not decode final reply segment: {}", e);
                Ok(())
            }
        }
    }
}

/// Default output device via rodio.
///
/// `rodio::OutputStream` is not `Send`, so it lives on its own thread for as
/// long as this handle does; the sinks only need the `Send` stream handle.
pub struct RodioOutput {
    handle: OutputStreamHandle,
    cue: Mutex<Sink>,
    reply: Arc<Mutex<Sink>>,
    /// Bumped by every reply stop so stale decoders quit appending.
    reply_generation: Arc<AtomicU64>,
    decoders: Arc<AtomicUsize>,
    _keepalive: std::sync::mpsc::Sender<()>,
}

impl RodioOutput {
    /// Open the default output device. Blocks until the device thread reports back.
    pub fn open() -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback");
        let (handle_tx, handle_rx) = std::sync::mpsc::channel::<VoiceResult<OutputStreamHandle>>();
        let (keepalive_tx, keepalive_rx) = std::sync::mpsc::channel::<()>();

        thread::Builder::new()
            .name("vuic-output".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    if handle_tx.send(Ok(handle)).is_err() {
                        return;
                    }
                    // Returns once the owning RodioOutput is dropped.
                    let _ = keepalive_rx.recv();
                    drop(stream);
                    debug!("output stream closed");
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(VoiceError::Playback(e.to_string())));
                }
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread exited before start".to_string()))??;
        let cue = new_sink(&handle)?;
        let reply = new_sink(&handle)?;
        info!("✅ Audio playback initialized");

        Ok(Self {
            handle,
            cue: Mutex::new(cue),
            reply: Arc::new(Mutex::new(reply)),
            reply_generation: Arc::new(AtomicU64::new(0)),
            decoders: Arc::new(AtomicUsize::new(0)),
            _keepalive: keepalive_tx,
        })
    }

    fn sink(&self, channel: OutputChannel) -> MutexGuard<'_, Sink> {
        let slot = match channel {
            OutputChannel::Cue => &self.cue,
            OutputChannel::Reply => &*self.reply,
        };
        lock_sink(slot)
    }
}

fn lock_sink(slot: &Mutex<Sink>) -> MutexGuard<'_, Sink> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

fn new_sink(handle: &OutputStreamHandle) -> VoiceResult<Sink> {
    Sink::try_new(handle).map_err(|e| VoiceError::Playback(e.to_string()))
}

impl AudioOutput for RodioOutput {
    fn enqueue(&self, channel: OutputChannel, bytes: Vec<u8>, volume: f32) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let source = rodio::Decoder::new(Cursor::new(bytes))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
        let sink = self.sink(channel);
        sink.set_volume(volume);
        sink.append(source);
        Ok(())
    }

    fn is_playing(&self, channel: OutputChannel) -> bool {
        let decoding = channel == OutputChannel::Reply && self.decoders.load(Ordering::SeqCst) > 0;
        decoding || !self.sink(channel).empty()
    }

    fn stop(&self, channel: OutputChannel) {
        if channel == OutputChannel::Reply {
            self.reply_generation.fetch_add(1, Ordering::SeqCst);
        }
        let mut sink = self.sink(channel);
        sink.stop();
        // A stopped sink silences anything appended later, so start a fresh one.
        match new_sink(&self.handle) {
            Ok(fresh) => *sink = fresh,
            Err(e) => warn!("could not recreate {:?} sink: {}", channel, e),
        }
        info!("⏹️ {:?} playback stopped", channel);
    }

    /// One decoder reads the whole reply, so frames split across network
    /// chunks decode intact.
    fn begin_stream(
        &self,
        channel: OutputChannel,
        volume: f32,
    ) -> VoiceResult<Box<dyn ReplyStream + '_>> {
        if channel != OutputChannel::Reply {
            return Ok(Box::new(SegmentedStream {
                output: self,
                channel,
                volume,
                pending: Vec::new(),
                queued: 0,
            }));
        }

        let buffer = Arc::new(GrowingBuffer::default());
        let decoder = ProgressiveDecoder {
            reader: GrowingReader {
                buffer: Arc::clone(&buffer),
                pos: 0,
            },
            target: ReplyTarget {
                sink: Arc::clone(&self.reply),
                volume,
                generation: self.reply_generation.load(Ordering::SeqCst),
                current_generation: Arc::clone(&self.reply_generation),
            },
            active: DecoderCount::enter(&self.decoders),
        };
        thread::Builder::new()
            .name("vuic-decode".to_string())
            .spawn(move || decoder.run())?;
        Ok(Box::new(RodioStream { buffer }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Probing,
    Decoding,
    Failed,
}

struct Progressive {
    bytes: Vec<u8>,
    finished: bool,
    state: DecodeState,
}

/// Bytes shared between the network side and the decoder thread.
struct GrowingBuffer {
    inner: Mutex<Progressive>,
    grown: Condvar,
}

impl Default for GrowingBuffer {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Progressive {
                bytes: Vec::new(),
                finished: false,
                state: DecodeState::Probing,
            }),
            grown: Condvar::new(),
        }
    }
}

impl GrowingBuffer {
    fn lock(&self) -> MutexGuard<'_, Progressive> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut Progressive)) {
        f(&mut self.lock());
        self.grown.notify_all();
    }

    fn state(&self) -> DecodeState {
        self.lock().state
    }
}

/// `Read + Seek` over a [`GrowingBuffer`]; reads block until bytes arrive or the stream ends.
struct GrowingReader {
    buffer: Arc<GrowingBuffer>,
    pos: u64,
}

impl Read for GrowingReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.buffer.lock();
        loop {
            let len = inner.bytes.len() as u64;
            if self.pos < len {
                let start = self.pos as usize;
                let n = out.len().min(inner.bytes.len() - start);
                out[..n].copy_from_slice(&inner.bytes[start..start + n]);
                self.pos += n as u64;
                return Ok(n);
            }
            if inner.finished || out.is_empty() {
                return Ok(0);
            }
            inner = self.buffer.grown.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Seek for GrowingReader {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let next = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                // The length is only known once the stream ends.
                let mut inner = self.buffer.lock();
                while !inner.finished {
                    inner = self.buffer.grown.wait(inner).unwrap_or_else(|e| e.into_inner());
                }
                (inner.bytes.len() as u64).checked_add_signed(delta)
            }
        };
        self.pos = next
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        Ok(self.pos)
    }
}

/// Keeps `is_playing(Reply)` true while a decoder thread is alive.
struct DecoderCount(Arc<AtomicUsize>);

impl DecoderCount {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for DecoderCount {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ProgressiveDecoder {
    reader: GrowingReader,
    target: ReplyTarget,
    active: DecoderCount,
}

impl ProgressiveDecoder {
    fn run(self) {
        let Self { reader, target, active: _active } = self;
        let buffer = Arc::clone(&reader.buffer);
        let decoder = match rodio::Decoder::new(reader) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("could not decode reply stream: {}", e);
                buffer.update(|p| p.state = DecodeState::Failed);
                return;
            }
        };
        buffer.update(|p| p.state = DecodeState::Decoding);

        let channels = decoder.channels();
        let rate = decoder.sample_rate();
        // About 100 ms of audio per appended buffer.
        let block = (rate as usize * channels as usize / 10).max(1);
        let mut samples: Vec<i16> = Vec::with_capacity(block);
        let mut blocks = 0usize;
        for sample in decoder {
            samples.push(sample);
            if samples.len() >= block {
                if !target.append(channels, rate, std::mem::take(&mut samples)) {
                    debug!("reply stream stopped; decoder exiting");
                    return;
                }
                blocks += 1;
            }
        }
        if !samples.is_empty() && target.append(channels, rate, samples) {
            blocks += 1;
        }
        debug!(blocks, "reply stream decoded");
    }
}

/// The reply sink as it was when a decoder started.
struct ReplyTarget {
    sink: Arc<Mutex<Sink>>,
    volume: f32,
    generation: u64,
    current_generation: Arc<AtomicU64>,
}

impl ReplyTarget {
    /// False once the reply lane has been stopped since the decoder started.
    fn append(&self, channels: u16, rate: u32, samples: Vec<i16>) -> bool {
        let sink = lock_sink(&self.sink);
        if self.current_generation.load(Ordering::SeqCst) != self.generation {
            return false;
        }
        sink.set_volume(self.volume);
        sink.append(SamplesBuffer::new(channels, rate, samples));
        true
    }
}

/// Network side of a [`ProgressiveDecoder`].
struct RodioStream {
    buffer: Arc<GrowingBuffer>,
}

impl ReplyStream for RodioStream {
    fn push(&mut self, bytes: Vec<u8>) -> VoiceResult<()> {
        if self.buffer.state() == DecodeState::Failed {
            return Err(not_decodable());
        }
        self.buffer.update(|p| p.bytes.extend_from_slice(&bytes));
        Ok(())
    }

    fn finish(self: Box<Self>) -> VoiceResult<()> {
        match self.buffer.state() {
            DecodeState::Failed => Err(not_decodable()),
            _ => Ok(()),
        }
    }
}

fn not_decodable() -> VoiceError {
    VoiceError::Playback("reply stream is not decodable".to_string())
}

impl Drop for RodioStream {
    fn drop(&mut self) {
        // Unblocks the decoder whether the stream ended, failed or was stopped.
        self.buffer.update(|p| p.finished = true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reader_over(buffer: &Arc<GrowingBuffer>) -> GrowingReader {
        GrowingReader {
            buffer: Arc::clone(buffer),
            pos: 0,
        }
    }

    #[test]
    fn reader_waits_for_bytes_pushed_later() {
        let buffer = Arc::new(GrowingBuffer::default());
        let mut stream = RodioStream {
            buffer: Arc::clone(&buffer),
        };
        stream.push(b"ab".to_vec()).unwrap();

        let mut reader = reader_over(&buffer);
        let consumer = thread::spawn(move || {
            let mut all = Vec::new();
            reader.read_to_end(&mut all).unwrap();
            all
        });
        thread::sleep(Duration::from_millis(20));
        stream.push(b"cd".to_vec()).unwrap();
        Box::new(stream).finish().unwrap();

        assert_eq!(consumer.join().unwrap(), b"abcd".to_vec());
    }

    #[test]
    fn seek_from_end_waits_for_the_full_length() {
        let buffer = Arc::new(GrowingBuffer::default());
        buffer.update(|p| p.bytes.extend_from_slice(b"1234"));

        let mut reader = reader_over(&buffer);
        let seeker = thread::spawn(move || reader.seek(SeekFrom::End(-1)).unwrap());
        thread::sleep(Duration::from_millis(20));
        buffer.update(|p| {
            p.bytes.extend_from_slice(b"56");
            p.finished = true;
        });
        assert_eq!(seeker.join().unwrap(), 5);

        let mut reader = reader_over(&buffer);
        assert_eq!(reader.seek(SeekFrom::Current(2)).unwrap(), 2);
        assert!(reader.seek(SeekFrom::Current(-3)).is_err());
    }

    /// A WAV whose header and samples are split mid-frame still decodes as one reply.
    #[test]
    fn split_wav_decodes_through_one_decoder() {
        let tone = crate::playback::tones::start_tone().unwrap();
        let buffer = Arc::new(GrowingBuffer::default());
        let mut stream = RodioStream {
            buffer: Arc::clone(&buffer),
        };
        let reader = reader_over(&buffer);
        let decoder = thread::spawn(move || rodio::Decoder::new(reader).map(|d| d.count()));

        for piece in tone.chunks(7) {
            stream.push(piece.to_vec()).unwrap();
        }
        drop(stream);

        let samples = decoder.join().unwrap().unwrap();
        let whole = rodio::Decoder::new(Cursor::new(tone)).unwrap().count();
        assert_eq!(samples, whole);
        assert!(samples > 0);
    }

    #[test]
    fn undecodable_stream_reports_failure_on_push_and_finish() {
        let buffer = Arc::new(GrowingBuffer::default());
        let mut stream = RodioStream {
            buffer: Arc::clone(&buffer),
        };
        buffer.update(|p| p.state = DecodeState::Failed);
        assert!(stream.push(b"x".to_vec()).is_err());
        assert!(Box::new(stream).finish().is_err());
        assert!(buffer.lock().finished);
    }
}
