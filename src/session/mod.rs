//! # Session Module
//!
//! The voice session engine and the state it exposes.
//!
//! ## Key Components:
//! - **Engine**: Actor owning the connection lifecycle, capture and playback
//! - **Status**: Snapshot and notification types observed by UIs
//! - **Context**: Date, time and location block appended to the agent instruction

pub mod context;
pub mod engine;
pub(crate) mod events;
pub mod status;

pub use context::{
    Coordinates, FixedLocation, HotelLocation, LocationProvider, LocationUnavailable,
    SessionContext, UserLocation,
};
pub use engine::{EngineSettings, VoiceEngine};
pub use status::{EngineNotification, EngineSnapshot, SessionStatus};
