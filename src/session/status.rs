//! Observable session state.

use serde::Serialize;
use std::fmt;

/// Lifecycle of the single voice session.
///
/// ```text
/// Disconnected ──connect──▶ Connecting ──opened──▶ Connected
///      ▲                        │                      │
///      └────── disconnect / closed ◀───────────────────┘
///                               │ setup or transport failure
///                               ▼
///                             Error ──connect──▶ Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "DISCONNECTED",
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Connected => "CONNECTED",
            SessionStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a UI needs to render the session: status, the last user-facing error
/// and whether the agent is currently audible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub status: SessionStatus,
    pub last_error: Option<String>,
    pub agent_talking: bool,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            last_error: None,
            agent_talking: false,
        }
    }
}

/// Discrete engine happenings, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    StatusChanged(SessionStatus),
    AgentStartedTalking,
    AgentStoppedTalking,
    /// A text turn from the agent.
    TextReceived(String),
}
