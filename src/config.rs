//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special variables (`HOST`, `PORT`, `GEMINI_API_KEY` / `API_KEY`)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_SESSION__VOICE_NAME`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore so that field names containing a single
//! underscore (`voice_name`, `input_sample_rate`) stay intact.

use crate::audio::codec::{INBOUND_SAMPLE_RATE, OUTBOUND_SAMPLE_RATE};
use crate::audio::capture::DEFAULT_FRAME_SAMPLES;
use crate::session::context::{Coordinates, HotelLocation};
use crate::transport::live::DEFAULT_ENDPOINT;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Default base instruction for the agent. Persona text is expected to be
/// replaced through config.toml in real deployments.
const DEFAULT_INSTRUCTION: &str = "You are Anjali, the warm and professional receptionist at Hotel MKR in Puri, Odisha. \
Reply in the language the user speaks. Keep every answer to one or two short sentences. \
You are on a voice call, so never use markdown or other formatting.";

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: where the control API listens
/// - **audio**: device names, sample rates and capture frame size
/// - **session**: what the agent is told when a session opens
/// - **transport**: where the agent lives and how to authenticate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub session: SessionSettings,
    pub transport: TransportConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio device configuration.
///
/// Empty device names select the host's default device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Rate of microphone audio sent to the agent
    pub input_sample_rate: u32,
    /// Rate of agent speech as delivered by the transport
    pub output_sample_rate: u32,
    /// Samples per capture frame (2048 at 16kHz ≈ 128ms)
    pub capture_frame_samples: usize,
    pub input_device: String,
    pub output_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub model: String,
    pub voice_name: String,
    /// Base system instruction; the real-time context block is appended per session
    pub instruction: String,
    /// Upper bound for the user location lookup
    pub context_timeout_ms: u64,
    pub hotel: HotelConfig,
    pub user_location: UserLocationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotelConfig {
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Fixed position reported as the user's location (kiosk deployments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLocationConfig {
    pub enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub endpoint: String,
    /// Empty means "not configured"; connecting then fails with a missing-credential error
    pub api_key: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let hotel = HotelLocation::default();
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                input_sample_rate: OUTBOUND_SAMPLE_RATE,
                output_sample_rate: INBOUND_SAMPLE_RATE,
                capture_frame_samples: DEFAULT_FRAME_SAMPLES,
                input_device: String::new(),
                output_device: String::new(),
            },
            session: SessionSettings {
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice_name: "Zephyr".to_string(),
                instruction: DEFAULT_INSTRUCTION.to_string(),
                context_timeout_ms: 5000,
                hotel: HotelConfig {
                    name: hotel.name,
                    address: hotel.address,
                    latitude: hotel.coordinates.latitude,
                    longitude: hotel.coordinates.longitude,
                },
                user_location: UserLocationConfig {
                    enabled: false,
                    latitude: 0.0,
                    longitude: 0.0,
                },
            },
            transport: TransportConfig {
                endpoint: DEFAULT_ENDPOINT.to_string(),
                api_key: String::new(),
            },
        }
    }
}

impl HotelConfig {
    pub fn location(&self) -> HotelLocation {
        HotelLocation {
            name: self.name.clone(),
            address: self.address.clone(),
            coordinates: Coordinates::new(self.latitude, self.longitude),
        }
    }
}

impl UserLocationConfig {
    pub fn coordinates(&self) -> Option<Coordinates> {
        self.enabled
            .then(|| Coordinates::new(self.latitude, self.longitude))
    }
}

impl AudioConfig {
    pub fn input_device_name(&self) -> Option<String> {
        non_empty(&self.input_device)
    }

    pub fn output_device_name(&self) -> Option<String> {
        non_empty(&self.output_device)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn check_coordinates(what: &str, latitude: f64, longitude: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(anyhow::anyhow!(
            "{} coordinates out of range: {}, {}",
            what,
            latitude,
            longitude
        ));
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSION__VOICE_NAME=Kore`: Override the agent voice
    /// - `APP_AUDIO__INPUT_DEVICE="USB Microphone"`: Pick a specific microphone
    /// - `GEMINI_API_KEY=...` or `API_KEY=...`: Credential for the live endpoint
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = env::var("GEMINI_API_KEY")
            .ok()
            .or_else(|| env::var("API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
        {
            settings = settings.set_override("transport.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing API key is not a configuration error: the server still starts and
    /// every connection attempt reports the missing credential to the user.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_frame_samples == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.session.context_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Context timeout must be greater than 0"));
        }

        if self.session.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Session model cannot be empty"));
        }

        if self.transport.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Transport endpoint cannot be empty"));
        }

        let hotel = &self.session.hotel;
        check_coordinates("Hotel", hotel.latitude, hotel.longitude)?;

        let user = &self.session.user_location;
        if user.enabled {
            check_coordinates("User location", user.latitude, user.longitude)?;
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only fields that are safe to change between sessions are accepted: server
    /// settings, voice, instruction and context timeout. Audio formats, locations and
    /// the credential stay fixed for the life of the process. Session values apply
    /// from the next connection attempt.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(voice) = session.get("voice_name").and_then(|v| v.as_str()) {
                self.session.voice_name = voice.to_string();
            }
            if let Some(instruction) = session.get("instruction").and_then(|v| v.as_str()) {
                self.session.instruction = instruction.to_string();
            }
            if let Some(timeout) = session.get("context_timeout_ms").and_then(|v| v.as_u64()) {
                self.session.context_timeout_ms = timeout;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Copy of the configuration that is safe to return over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.transport.api_key.is_empty() {
            copy.transport.api_key = "<redacted>".to_string();
        }
        copy
    }
}
