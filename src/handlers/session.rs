//! HTTP control surface for the voice session.
//!
//! Commands are accepted immediately and answered with `202 Accepted` plus the
//! snapshot at that moment; the outcome of a connect shows up in later snapshots
//! (poll `GET /session` or subscribe on `/ws/session`).

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct TextMessage {
    pub text: String,
}

pub async fn get_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.engine.snapshot()
    })))
}

pub async fn connect(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.engine.connect()?;
    accepted(&state, "connect")
}

pub async fn disconnect(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.engine.disconnect()?;
    accepted(&state, "disconnect")
}

pub async fn send_text(
    state: web::Data<AppState>,
    body: web::Json<TextMessage>,
) -> Result<HttpResponse, AppError> {
    let text = body.into_inner().text;
    if text.trim().is_empty() {
        return Err(AppError::BadRequest("Message text cannot be empty".to_string()));
    }
    state.engine.send_text_message(text)?;
    accepted(&state, "text")
}

fn accepted(state: &AppState, command: &str) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "command": command,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.engine.snapshot()
    })))
}
