//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: failures of the HTTP control surface, converted into JSON
//!   responses through actix's `ResponseError`
//! - **SetupError / EngineError**: failures of the voice session itself. Each one
//!   carries a `user_message()` that is safe to show in a UI
//!
//! Recoverable pipeline errors (`DecodeError`, send failures, teardown failures) are
//! logged where they happen and never reach these types.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Server port cannot be 0",
//!     "timestamp": "2026-10-19T12:00:00Z"
//!   }
//! }
//! ```

use crate::audio::device::DeviceError;
use crate::transport::TransportError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: The voice engine is not running (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Stopped => AppError::Unavailable(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Why a connection attempt could not be set up. Fatal for the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// No API key is configured.
    MissingCredential,
    /// The microphone could not be acquired because access was refused.
    MicrophoneDenied,
    /// An audio device failed to open for any other reason.
    Device(DeviceError),
    /// The transport could not open a session.
    Transport(TransportError),
}

impl SetupError {
    pub fn user_message(&self) -> String {
        match self {
            SetupError::MissingCredential => {
                "API key is missing. Set GEMINI_API_KEY and try again.".to_string()
            }
            SetupError::MicrophoneDenied => {
                "Microphone access was denied. Please allow microphone access and try again."
                    .to_string()
            }
            SetupError::Device(e) => format!("Could not open the audio device: {}", e),
            SetupError::Transport(_) => "Failed to initiate connection.".to_string(),
        }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::MissingCredential => write!(f, "missing API key"),
            SetupError::MicrophoneDenied => write!(f, "microphone permission denied"),
            SetupError::Device(e) => write!(f, "device setup failed: {}", e),
            SetupError::Transport(e) => write!(f, "transport setup failed: {}", e),
        }
    }
}

impl std::error::Error for SetupError {}

/// Input devices report refused access as `PermissionDenied`; everything else is
/// a generic device failure.
impl From<DeviceError> for SetupError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied => SetupError::MicrophoneDenied,
            other => SetupError::Device(other),
        }
    }
}

impl From<TransportError> for SetupError {
    fn from(err: TransportError) -> Self {
        SetupError::Transport(err)
    }
}

/// Errors that move the session into the `Error` state, plus the one error the
/// engine handle itself can return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Setup(SetupError),
    /// The transport reported a failure on an open session.
    Transport(String),
    /// The engine task has shut down; commands can no longer be delivered.
    Stopped,
}

impl EngineError {
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Setup(e) => e.user_message(),
            EngineError::Transport(_) => "Connection error. Please try again.".to_string(),
            EngineError::Stopped => "The voice engine is not running.".to_string(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Setup(e) => write!(f, "{}", e),
            EngineError::Transport(detail) => write!(f, "transport error: {}", detail),
            EngineError::Stopped => write!(f, "voice engine has stopped"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<SetupError> for EngineError {
    fn from(err: SetupError) -> Self {
        EngineError::Setup(err)
    }
}
