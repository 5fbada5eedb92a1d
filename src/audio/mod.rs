//! # Audio Module
//!
//! Everything that touches raw audio on the local side of a voice session.
//!
//! ## Key Components:
//! - **Chunk**: Immutable PCM buffers that move between pipeline stages
//! - **Codec**: Float samples ⇄ 16-bit little-endian PCM wire payloads
//! - **Scheduler**: Gapless playback of inbound chunks against the output clock
//! - **Capture**: Fixed-cadence microphone frames forwarded to the transport
//! - **Device**: The input/output device boundary (traits) and the cpal backend
//!
//! ## Wire Formats:
//! - **Outbound** (microphone): 16kHz, 16-bit PCM, mono
//! - **Inbound** (agent voice): 24kHz, 16-bit PCM, mono
//! - **Encoding**: Little-endian signed integers

pub mod capture;      // Microphone frame pump with generation token
pub mod chunk;        // AudioChunk
pub mod codec;        // PCM encode/decode
pub mod device;       // Device traits shared by real and test backends
pub mod resample;     // Streaming linear resampler
pub mod scheduler;    // Gapless playback scheduling

#[cfg(feature = "native-audio")]
pub mod native;       // cpal-backed microphone and speaker

pub use capture::CapturePipeline;
pub use chunk::AudioChunk;
pub use codec::{AudioPayload, DecodeError, PcmFormat};
pub use device::{AudioBackend, DeviceError, InputPath, OutputPath, PlaybackId, PlaybackNotifier};
pub use scheduler::{PlaybackScheduler, ScheduleError, ScheduledPlayback};
