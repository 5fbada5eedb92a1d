//! # PCM Codec
//!
//! Converts between the engine's native float samples and the 16-bit little-endian
//! PCM carried on the wire, in both directions.
//!
//! ## Conversions:
//! - **Outbound**: `f32` in [-1.0, 1.0] → clipped `i16` → little-endian bytes,
//!   wrapped in an [`AudioPayload`] tagged `audio/pcm;rate=16000`
//! - **Inbound**: tagged bytes → `i16` → `f32` in [-1.0, 1.0] → [`AudioChunk`]
//!
//! ## Error Handling:
//! Decoding never panics and never guesses. Empty, truncated or mis-tagged payloads
//! come back as a [`DecodeError`] so the session can drop the chunk and carry on.

use crate::audio::chunk::AudioChunk;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

/// Sample rate of microphone audio sent to the agent.
pub const OUTBOUND_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the agent's synthesized speech.
pub const INBOUND_SAMPLE_RATE: u32 = 24_000;

/// A 16-bit PCM stream format: sample rate and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const fn mono(sample_rate: u32) -> Self {
        Self { sample_rate, channels: 1 }
    }

    /// Default outbound format (16kHz mono).
    pub const fn outbound() -> Self {
        Self::mono(OUTBOUND_SAMPLE_RATE)
    }

    /// Default inbound format (24kHz mono).
    pub const fn inbound() -> Self {
        Self::mono(INBOUND_SAMPLE_RATE)
    }

    /// MIME tag used in transport envelopes, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Parse a MIME tag such as `audio/pcm;rate=24000`.
    ///
    /// `audio/pcm` and `audio/L16` are both accepted as 16-bit PCM. A tag without a
    /// `rate` parameter keeps the sample rate of `fallback`.
    pub fn from_mime_type(mime_type: &str, fallback: PcmFormat) -> Result<Self, DecodeError> {
        let mut parts = mime_type.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default().to_ascii_lowercase();
        if essence != "audio/pcm" && essence != "audio/l16" {
            return Err(DecodeError::UnsupportedEncoding(mime_type.to_string()));
        }

        let mut format = fallback;
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => {
                    format.sample_rate = value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|rate| *rate > 0)
                        .ok_or_else(|| DecodeError::InvalidSampleRate(value.to_string()))?;
                }
                "channels" => {
                    format.channels = value
                        .trim()
                        .parse::<u16>()
                        .ok()
                        .filter(|channels| *channels > 0)
                        .ok_or_else(|| DecodeError::UnsupportedEncoding(mime_type.to_string()))?;
                }
                _ => {}
            }
        }
        Ok(format)
    }
}

/// Transport envelope for one chunk of encoded audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl AudioPayload {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// Reasons an inbound payload could not be turned into playable audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload carried no bytes at all.
    Empty,
    /// Byte count is not a multiple of two, so the last sample is truncated.
    Truncated { len: usize },
    /// Sample count does not divide evenly into the declared channel count.
    Misaligned { samples: usize, channels: u16 },
    /// The MIME tag names something other than 16-bit PCM.
    UnsupportedEncoding(String),
    /// The MIME tag carries an unusable sample rate.
    InvalidSampleRate(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "audio payload is empty"),
            DecodeError::Truncated { len } => {
                write!(f, "audio payload has odd length {} for 16-bit samples", len)
            }
            DecodeError::Misaligned { samples, channels } => write!(
                f,
                "{} samples do not divide into {} channels",
                samples, channels
            ),
            DecodeError::UnsupportedEncoding(mime) => {
                write!(f, "unsupported audio encoding '{}'", mime)
            }
            DecodeError::InvalidSampleRate(rate) => write!(f, "invalid sample rate '{}'", rate),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Convert one float sample to 16-bit PCM, clipping to range.
///
/// Negative values scale by 32768 and positive values by 32767 so both ends of
/// [-1.0, 1.0] land exactly on `i16::MIN` / `i16::MAX`. NaN becomes silence.
pub fn float_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clipped = sample.clamp(-1.0, 1.0);
    if clipped < 0.0 {
        (clipped * 32768.0) as i16
    } else {
        (clipped * 32767.0) as i16
    }
}

/// Convert one 16-bit PCM sample to a float in [-1.0, 1.0).
pub fn pcm16_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode float samples as little-endian 16-bit PCM bytes.
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let pcm: Vec<i16> = samples.iter().copied().map(float_to_pcm16).collect();
    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);
    bytes
}

/// Decode little-endian 16-bit PCM bytes into float samples.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::Truncated { len: bytes.len() });
    }

    let mut pcm = vec![0i16; bytes.len() / 2];
    let mut cursor = Cursor::new(bytes);
    cursor
        .read_i16_into::<LittleEndian>(&mut pcm)
        .map_err(|_| DecodeError::Truncated { len: bytes.len() })?;

    Ok(pcm.into_iter().map(pcm16_to_float).collect())
}

/// Encode a captured chunk into the outbound transport envelope.
///
/// Consumes the chunk: after encoding it has been handed off.
pub fn encode_chunk(chunk: AudioChunk) -> AudioPayload {
    let format = PcmFormat {
        sample_rate: chunk.sample_rate(),
        channels: chunk.channels(),
    };
    AudioPayload::new(format.mime_type(), encode_samples(chunk.samples()))
}

/// Decode an inbound envelope into a playable chunk.
///
/// ## Parameters:
/// - **payload**: bytes plus MIME tag as received from the transport
/// - **fallback**: format to assume when the tag omits parameters
pub fn decode_payload(
    payload: &AudioPayload,
    fallback: PcmFormat,
) -> Result<AudioChunk, DecodeError> {
    let format = PcmFormat::from_mime_type(&payload.mime_type, fallback)?;
    let samples = decode_samples(&payload.data)?;

    if samples.len() % format.channels as usize != 0 {
        return Err(DecodeError::Misaligned {
            samples: samples.len(),
            channels: format.channels,
        });
    }

    Ok(AudioChunk::new(samples, format.sample_rate, format.channels))
}
