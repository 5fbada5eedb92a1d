//! # Voice Session Engine
//!
//! A real-time, full-duplex voice session with a remote conversational agent:
//! microphone audio streams out as 16kHz PCM while the agent's 24kHz speech is
//! played back gaplessly, with barge-in, text turns and a single observable status.

pub mod audio;      // Capture, codec, playback scheduling, devices
pub mod config;     // Configuration management
pub mod error;      // Error types and HTTP error responses
pub mod handlers;   // HTTP request handlers
pub mod health;     // Health check endpoint
pub mod session;    // The session engine actor
pub mod state;      // Shared application state
pub mod transport;  // Remote agent link
pub mod websocket;  // Session WebSocket for UIs

#[cfg(test)]
pub(crate) mod testing;
