//! # Transport Module
//!
//! The boundary between the session engine and the remote conversational agent.
//!
//! ## Key Components:
//! - **SessionConfig**: What the engine asks for when it opens a session
//! - **TransportEvent**: Everything the agent side can tell the engine
//! - **Transport / TransportHandle**: Open a session, then send audio and text on it
//! - **Live**: WebSocket implementation of the live-audio protocol
//!
//! Events flow into an [`EventSink`] supplied by the engine. The sink is tagged with
//! the session attempt that opened it, so events from an abandoned attempt are
//! recognised and dropped on arrival.

pub mod live;

use crate::audio::codec::{AudioPayload, PcmFormat};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

pub use live::LiveTransport;

/// Parameters for one live session.
#[derive(Clone, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub api_key: String,
    pub voice_name: String,
    /// Complete system instruction, including the real-time context block.
    pub instruction: String,
    pub input_format: PcmFormat,
    pub output_format: PcmFormat,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("voice_name", &self.voice_name)
            .field("instruction_len", &self.instruction.len())
            .field("input_format", &self.input_format)
            .field("output_format", &self.output_format)
            .finish()
    }
}

/// Events delivered from the agent side.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The session is ready for audio.
    Opened,
    AudioReceived(AudioPayload),
    TextReceived(String),
    /// The user barged in; queued agent speech should be cut off.
    Interrupted,
    /// The remote side ended the session, with an optional reason.
    Closed(Option<String>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Open(String),
    Send(String),
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Open(msg) => write!(f, "failed to open session: {}", msg),
            TransportError::Send(msg) => write!(f, "failed to send: {}", msg),
            TransportError::Closed => write!(f, "session is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Callback receiving transport events. Cheap to clone.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(TransportEvent) + Send + Sync>);

impl EventSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// Opens sessions with a remote agent.
pub trait Transport: Send + Sync {
    /// Open a session. Resolves once the connection is established; `Opened` may be
    /// emitted on `events` before or after this future completes.
    fn open(
        &self,
        config: SessionConfig,
        events: EventSink,
    ) -> BoxFuture<'static, Result<Box<dyn TransportHandle>, TransportError>>;
}

/// A live session. Sends never block on the network.
pub trait TransportHandle: Send {
    fn send_audio(&mut self, payload: AudioPayload) -> Result<(), TransportError>;

    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close the session. Closing an already-closed session succeeds.
    fn close(&mut self) -> Result<(), TransportError>;
}
