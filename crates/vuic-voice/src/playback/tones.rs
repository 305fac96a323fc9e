//! Generated interface cues.

use crate::capture::encode_wav;
use crate::error::VoiceResult;
use std::f32::consts::TAU;
use std::path::Path;
use tracing::warn;

const TONE_SAMPLE_RATE: u32 = 22050;
const NOTE_MS: u32 = 90;
const FADE_MS: u32 = 10;

/// Rising two-note cue played when listening starts.
pub fn start_tone() -> VoiceResult<Vec<u8>> {
    encode_wav(&notes(&[660.0, 880.0]), TONE_SAMPLE_RATE)
}

/// Falling two-note cue played when the interaction ends.
pub fn end_tone() -> VoiceResult<Vec<u8>> {
    encode_wav(&notes(&[880.0, 660.0]), TONE_SAMPLE_RATE)
}

/// Read a configured cue file, or fall back to the generated cue.
pub fn load_or_generate(
    path: Option<&Path>,
    generate: fn() -> VoiceResult<Vec<u8>>,
) -> VoiceResult<Vec<u8>> {
    if let Some(path) = path {
        match std::fs::read(path) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => warn!("could not read cue {}: {}; using generated tone", path.display(), e),
        }
    }
    generate()
}

fn notes(frequencies: &[f32]) -> Vec<f32> {
    let note_len = (TONE_SAMPLE_RATE * NOTE_MS / 1000) as usize;
    let fade_len = (TONE_SAMPLE_RATE * FADE_MS / 1000) as usize;
    let mut samples = Vec::with_capacity(note_len * frequencies.len());
    for &freq in frequencies {
        for i in 0..note_len {
            // Linear fade in/out avoids clicks at note edges.
            let envelope = (i.min(note_len - 1 - i) as f32 / fade_len as f32).min(1.0);
            let t = i as f32 / TONE_SAMPLE_RATE as f32;
            samples.push((TAU * freq * t).sin() * envelope * 0.8);
        }
    }
    samples
}
