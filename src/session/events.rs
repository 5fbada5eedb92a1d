//! Messages consumed by the session actor.
//!
//! Every input to the engine, whether a caller command, a device callback or a
//! transport event, becomes one of these and is handled in arrival order by a
//! single task. Callback-originated events carry the generation they were created
//! under; the actor drops any whose generation is no longer current.

use crate::audio::codec::AudioPayload;
use crate::audio::device::PlaybackId;
use crate::error::SetupError;
use crate::session::engine::{EngineSettings, SessionDevices};
use crate::transport::{TransportEvent, TransportHandle};
use tokio::sync::oneshot;

pub(crate) type Generation = u64;

pub(crate) enum EngineEvent {
    Connect,
    Disconnect,
    SendText(String),
    /// Applies from the next connection attempt.
    UpdateSettings(EngineSettings),
    /// Replies once every event queued before it has been handled.
    Flush(oneshot::Sender<()>),
    /// Speaker and microphone opened by the setup task.
    DevicesReady {
        generation: Generation,
        devices: SessionDevices,
    },
    SetupFinished {
        generation: Generation,
        result: Result<Box<dyn TransportHandle>, SetupError>,
    },
    Transport {
        generation: Generation,
        event: TransportEvent,
    },
    CapturedAudio {
        generation: Generation,
        payload: AudioPayload,
    },
    PlaybackEnded {
        generation: Generation,
        id: PlaybackId,
    },
    /// Tear down and stop the actor, acknowledging once done.
    Shutdown(oneshot::Sender<()>),
}

impl EngineEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            EngineEvent::Connect => "connect",
            EngineEvent::Disconnect => "disconnect",
            EngineEvent::SendText(_) => "send_text",
            EngineEvent::UpdateSettings(_) => "update_settings",
            EngineEvent::Flush(_) => "flush",
            EngineEvent::DevicesReady { .. } => "devices_ready",
            EngineEvent::SetupFinished { .. } => "setup_finished",
            EngineEvent::Transport { .. } => "transport",
            EngineEvent::CapturedAudio { .. } => "captured_audio",
            EngineEvent::PlaybackEnded { .. } => "playback_ended",
            EngineEvent::Shutdown(_) => "shutdown",
        }
    }
}
