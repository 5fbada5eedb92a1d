//! # Audio Chunks
//!
//! An [`AudioChunk`] is the unit that moves through both pipelines: capture frames on
//! the way out, decoded agent speech on the way in. Chunks are immutable and are
//! consumed by value, so a stage that hands a chunk on can never touch it again.

use std::sync::Arc;

/// Interleaved PCM samples plus the format needed to play or encode them.
///
/// ## Ownership:
/// The samples live behind an `Arc<[f32]>` so the output device can keep the buffer
/// alive on its render thread without copying, but there is no `Clone` impl: every
/// handoff (`encode_chunk`, `PlaybackScheduler::schedule`) takes the chunk by value.
#[derive(Debug, PartialEq)]
pub struct AudioChunk {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioChunk {
    /// Create a chunk from interleaved samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Mono convenience constructor.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds.
    ///
    /// ## Calculation:
    /// Duration = frames / sample_rate. A chunk with a zero sample rate has no
    /// meaningful duration and reports 0.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Give up the chunk and keep only the shared sample buffer.
    pub fn into_samples(self) -> Arc<[f32]> {
        self.samples
    }
}
