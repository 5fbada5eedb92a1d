//! # Audio Device Boundary
//!
//! Traits separating the session engine from the platform audio stack. The cpal
//! backend in [`crate::audio::native`] implements them for real hardware; tests use
//! in-memory fakes that drive the clock by hand.

use crate::audio::chunk::AudioChunk;
use std::fmt;
use std::sync::Arc;

/// Identifier of one scheduled playback on an output path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaybackId(pub u64);

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "playback-{}", self.0)
    }
}

/// Receives each captured frame: `frame_samples` mono samples at the input rate.
pub type FrameSink = Box<dyn FnMut(Vec<f32>) + Send + 'static>;

/// Called once per playback when it ends on its own. Never called for playbacks
/// cut off by [`OutputPath::stop_all`].
pub type PlaybackNotifier = Arc<dyn Fn(PlaybackId) + Send + Sync + 'static>;

/// Failures raised by audio devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The user or the OS refused microphone access.
    PermissionDenied,
    /// No matching device exists.
    NotFound(String),
    /// The device cannot run in any format we can use.
    Unsupported(String),
    /// Stream construction or playback failed.
    Stream(String),
    /// The device was already closed.
    Closed,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::PermissionDenied => write!(f, "permission to use the device was denied"),
            DeviceError::NotFound(name) => write!(f, "audio device not found: {}", name),
            DeviceError::Unsupported(msg) => write!(f, "unsupported device configuration: {}", msg),
            DeviceError::Stream(msg) => write!(f, "audio stream error: {}", msg),
            DeviceError::Closed => write!(f, "audio device is closed"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// A microphone opened at a fixed sample rate.
pub trait InputPath: Send {
    /// Rate of the frames delivered to the sink.
    fn sample_rate(&self) -> u32;

    /// Begin delivering frames of exactly `frame_samples` samples to `sink`.
    fn start(&mut self, frame_samples: usize, sink: FrameSink) -> Result<(), DeviceError>;

    /// Stop delivering frames. The device stays open and may be started again.
    fn stop(&mut self);

    /// Release the microphone. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// A speaker with a monotonic playback clock.
pub trait OutputPath: Send {
    fn sample_rate(&self) -> u32;

    /// Current time of the output clock in seconds.
    fn now(&self) -> f64;

    /// Play `chunk` starting at clock time `at`. A start time already in the past
    /// plays immediately.
    fn start(&mut self, id: PlaybackId, chunk: AudioChunk, at: f64) -> Result<(), DeviceError>;

    /// Stop every playback started so far, including ones whose start time has
    /// not arrived yet. None of them produce audio afterwards or report an end.
    fn stop_all(&mut self);

    /// Release the speaker. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Opens device paths for one session attempt.
pub trait AudioBackend: Send + Sync {
    fn open_output(
        &self,
        sample_rate: u32,
        notifier: PlaybackNotifier,
    ) -> Result<Box<dyn OutputPath>, DeviceError>;

    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputPath>, DeviceError>;
}
