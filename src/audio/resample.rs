// Streaming Linear Resampler
// Zero-lookahead linear interpolation, safe to call chunk by chunk

use crate::audio::chunk::AudioChunk;
use std::sync::Arc;

/// Streaming resampler using linear interpolation.
///
/// Converts microphone audio at whatever rate the device runs at into the rate the
/// transport expects. Position is carried across calls, so feeding a stream in
/// arbitrary slices yields the same output as feeding it in one piece.
pub struct StreamingResampler {
    /// Ratio of input rate to output rate, e.g. 48000/16000 = 3.0
    ratio: f64,
    /// Read position, where index 0 is the last sample of the previous call
    position: f64,
    /// Last input sample seen, used to interpolate across call boundaries
    prev_sample: f32,
    initialized: bool,
}

impl StreamingResampler {
    pub fn new(input_sample_rate: u32, output_sample_rate: u32) -> Self {
        let ratio = input_sample_rate.max(1) as f64 / output_sample_rate.max(1) as f64;
        tracing::debug!(
            "Resampler created: {}Hz -> {}Hz (ratio {:.4})",
            input_sample_rate,
            output_sample_rate,
            ratio
        );

        Self {
            ratio,
            position: 0.0,
            prev_sample: 0.0,
            initialized: false,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        (self.ratio - 1.0).abs() < f64::EPSILON
    }

    /// Resample one slice of the input stream.
    pub fn resample(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }
        if self.is_passthrough() {
            return input.to_vec();
        }

        if !self.initialized {
            self.prev_sample = input[0];
            self.initialized = true;
        }

        let len = input.len();
        let sample_at = |index: usize| -> f32 {
            if index == 0 {
                self.prev_sample
            } else {
                input[index - 1]
            }
        };

        let mut output = Vec::with_capacity((len as f64 / self.ratio) as usize + 2);
        while (self.position.floor() as usize) < len {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let a = sample_at(index);
            let b = sample_at(index + 1);
            output.push(a + frac * (b - a));
            self.position += self.ratio;
        }

        self.position -= len as f64;
        self.prev_sample = input[len - 1];
        output
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.prev_sample = 0.0;
        self.initialized = false;
    }
}

/// Converts inbound agent chunks to the speaker's mono device rate.
///
/// Consecutive chunks of one reply form a single stream, so one resampler is kept
/// across them and chunk boundaries stay continuous. [`reset`](Self::reset) starts a
/// fresh stream after an interrupt.
pub struct PlaybackResampler {
    device_rate: u32,
    stream: Option<(u32, StreamingResampler)>,
}

impl PlaybackResampler {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            stream: None,
        }
    }

    pub fn convert(&mut self, chunk: AudioChunk) -> Arc<[f32]> {
        let channels = chunk.channels().max(1) as usize;
        let rate = chunk.sample_rate();
        if channels == 1 && rate == self.device_rate {
            return chunk.into_samples();
        }

        let mono: Vec<f32> = if channels > 1 {
            chunk
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        } else {
            chunk.samples().to_vec()
        };
        if rate == self.device_rate {
            return mono.into();
        }

        if self.stream.as_ref().is_some_and(|(stream_rate, _)| *stream_rate != rate) {
            self.stream = None;
        }
        let device_rate = self.device_rate;
        let (_, resampler) = self
            .stream
            .get_or_insert_with(|| (rate, StreamingResampler::new(rate, device_rate)));
        resampler.resample(&mono).into()
    }

    pub fn reset(&mut self) {
        if let Some((_, resampler)) = self.stream.as_mut() {
            resampler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_3x() {
        let mut resampler = StreamingResampler::new(48_000, 16_000);
        let input: Vec<f32> = (0..48).map(|i| i as f32 / 48.0).collect();
        let output = resampler.resample(&input);
        assert_eq!(output.len(), 16);
    }

    #[test]
    fn test_chunked_input_matches_single_pass() {
        let signal: Vec<f32> = (0..960).map(|i| ((i as f32) * 0.01).sin()).collect();

        let mut whole = StreamingResampler::new(44_100, 16_000);
        let expected = whole.resample(&signal);

        let mut pieces = StreamingResampler::new(44_100, 16_000);
        let mut actual = Vec::new();
        for slice in signal.chunks(37) {
            actual.extend(pieces.resample(slice));
        }

        assert_eq!(expected.len(), actual.len());
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_constant_signal_stays_constant() {
        let mut resampler = StreamingResampler::new(48_000, 16_000);
        let out = resampler.resample(&[0.5; 480]);
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_same_rate_passes_through() {
        let mut resampler = StreamingResampler::new(16_000, 16_000);
        assert_eq!(resampler.resample(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_playback_chunks_join_without_a_seam() {
        let ramp: Vec<f32> = (0..4800).map(|i| i as f32 / 4800.0).collect();

        let mut whole = PlaybackResampler::new(48_000);
        let expected = whole.convert(AudioChunk::mono(ramp.clone(), 24_000));

        let mut chunked = PlaybackResampler::new(48_000);
        let mut actual: Vec<f32> = Vec::new();
        for piece in ramp.chunks(1000) {
            actual.extend_from_slice(&chunked.convert(AudioChunk::mono(piece.to_vec(), 24_000)));
        }

        assert_eq!(expected.len(), actual.len());
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_playback_reset_starts_a_fresh_stream() {
        let mut converter = PlaybackResampler::new(48_000);
        converter.convert(AudioChunk::mono(vec![1.0; 100], 24_000));
        converter.reset();

        let out = converter.convert(AudioChunk::mono(vec![0.25; 100], 24_000));
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_playback_stereo_is_downmixed() {
        let mut converter = PlaybackResampler::new(24_000);
        let out = converter.convert(AudioChunk::new(vec![0.5, 0.1, 0.3, 0.3], 24_000, 2));
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert!((out[1] - 0.3).abs() < 1e-6);
    }
}
