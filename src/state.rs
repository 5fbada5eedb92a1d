//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Ownership:
//! - **config**: `Arc<RwLock<AppConfig>>`, many readers or one writer. Handlers clone
//!   the config out instead of holding the lock across an await point
//! - **engine**: the voice engine handle. It is already a cheap, cloneable handle to
//!   a single actor, so it needs no lock of its own
//! - **start_time**: never changes

use crate::config::AppConfig;
use crate::session::{EngineSettings, VoiceEngine};
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// The one voice session engine for this process
    pub engine: VoiceEngine,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, engine: VoiceEngine) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            engine,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// A poisoned lock still holds a valid config (writers only ever assign a fully
    /// validated value), so the guard is recovered rather than propagated.
    pub fn get_config(&self) -> AppConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate and store a new configuration, then hand the session-relevant part
    /// to the engine. The engine applies it from the next `connect()`.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        let settings = EngineSettings::from_config(&new_config);
        match self.config.write() {
            Ok(mut guard) => *guard = new_config,
            Err(poisoned) => *poisoned.into_inner() = new_config,
        }

        if let Err(e) = self.engine.update_settings(settings) {
            tracing::warn!("Voice engine did not accept new settings: {}", e);
        }
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
