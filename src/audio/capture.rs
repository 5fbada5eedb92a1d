//! # Capture Pipeline
//!
//! Pumps fixed-size microphone frames through the codec and hands the encoded
//! payloads to a forwarding callback (the session engine's event queue).
//!
//! ## Stop Guarantee:
//! Every `start` mints a fresh [`CaptureToken`]. The frame sink checks the token
//! before doing anything, and `stop` revokes it before touching the device, so no
//! frame is forwarded once `stop` has returned, even if the device thread is still
//! draining its buffer.

use crate::audio::chunk::AudioChunk;
use crate::audio::codec::{encode_chunk, AudioPayload};
use crate::audio::device::{DeviceError, InputPath};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default frame size: 2048 samples, 128ms at 16kHz.
pub const DEFAULT_FRAME_SAMPLES: usize = 2048;

/// Revocable permission for a frame sink to forward audio.
#[derive(Debug, Clone)]
pub struct CaptureToken(Arc<AtomicBool>);

impl CaptureToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CapturePipeline {
    input: Option<Box<dyn InputPath>>,
    frame_samples: usize,
    token: Option<CaptureToken>,
}

impl CapturePipeline {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            input: None,
            frame_samples: frame_samples.max(1),
            token: None,
        }
    }

    /// Take ownership of a freshly opened microphone, releasing any previous one.
    pub fn attach(&mut self, input: Box<dyn InputPath>) {
        self.release();
        self.input = Some(input);
    }

    /// Start forwarding frames. Calling `start` while already running does nothing.
    pub fn start<F>(&mut self, forward: F) -> Result<(), DeviceError>
    where
        F: Fn(AudioPayload) + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }
        let input = match self.input.as_mut() {
            Some(input) if !input.is_closed() => input,
            _ => return Err(DeviceError::Closed),
        };

        let token = CaptureToken::new();
        let sink_token = token.clone();
        let sample_rate = input.sample_rate();

        input.start(
            self.frame_samples,
            Box::new(move |samples: Vec<f32>| {
                if !sink_token.is_active() {
                    return;
                }
                forward(encode_chunk(AudioChunk::mono(samples, sample_rate)));
            }),
        )?;

        tracing::debug!(
            "Capture started: {} samples per frame at {}Hz",
            self.frame_samples,
            sample_rate
        );
        self.token = Some(token);
        Ok(())
    }

    /// Stop forwarding frames. The microphone stays open.
    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.revoke();
            if let Some(input) = self.input.as_mut() {
                input.stop();
            }
            tracing::debug!("Capture stopped");
        }
    }

    /// Stop and release the microphone. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.stop();
        if let Some(mut input) = self.input.take() {
            if !input.is_closed() {
                input.close();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.token.as_ref().map(CaptureToken::is_active).unwrap_or(false)
    }

    pub fn holds_device(&self) -> bool {
        self.input.is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeInput;
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<AudioPayload>>>, impl Fn(AudioPayload) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |payload| sink.lock().unwrap().push(payload))
    }

    #[test]
    fn test_frames_are_encoded_and_forwarded() {
        let (input, probe) = FakeInput::new(16_000);
        let mut capture = CapturePipeline::new(DEFAULT_FRAME_SAMPLES);
        capture.attach(Box::new(input));

        let (seen, forward) = collector();
        capture.start(forward).unwrap();
        probe.push_frame(vec![0.0; DEFAULT_FRAME_SAMPLES]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].mime_type, "audio/pcm;rate=16000");
        assert_eq!(seen[0].data.len(), DEFAULT_FRAME_SAMPLES * 2);
        assert_eq!(probe.frame_samples(), Some(DEFAULT_FRAME_SAMPLES));
    }

    #[test]
    fn test_no_frames_after_stop() {
        let (input, probe) = FakeInput::new(16_000);
        let mut capture = CapturePipeline::new(DEFAULT_FRAME_SAMPLES);
        capture.attach(Box::new(input));

        let (seen, forward) = collector();
        capture.start(forward).unwrap();
        capture.stop();
        assert!(!capture.is_running());

        // A frame already in flight on the device thread is dropped by the token.
        probe.push_stale_frame(vec![0.3; DEFAULT_FRAME_SAMPLES]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_is_idempotent() {
        let (input, probe) = FakeInput::new(16_000);
        let mut capture = CapturePipeline::new(DEFAULT_FRAME_SAMPLES);
        capture.attach(Box::new(input));

        let (_seen, forward) = collector();
        capture.start(forward).unwrap();
        let (_other, forward) = collector();
        capture.start(forward).unwrap();

        assert_eq!(probe.start_count(), 1);
    }

    #[test]
    fn test_release_closes_microphone_once() {
        let (input, probe) = FakeInput::new(16_000);
        let mut capture = CapturePipeline::new(DEFAULT_FRAME_SAMPLES);
        capture.attach(Box::new(input));

        capture.release();
        capture.release();

        assert!(!capture.holds_device());
        assert_eq!(probe.close_count(), 1);

        let (_seen, forward) = collector();
        assert_eq!(capture.start(forward), Err(DeviceError::Closed));
    }
}
