//! # Session WebSocket
//!
//! Live control and observation of the voice session for UI clients.
//! Clients connect to `/ws/session`.
//!
//! ## Protocol:
//! 1. **Connection**: The server immediately sends the current `status`
//! 2. **Commands**: Client sends JSON `connect`, `disconnect`, `text` or `ping`
//! 3. **Updates**: Server sends `status` on every snapshot change and `transcript`
//!    for each agent text turn
//!
//! ## Message Format:
//! ```json
//! {"type": "text", "text": "Is the pool open late?"}
//! {"type": "status", "session": {"status": "CONNECTED", "last_error": null, "agent_talking": true}}
//! ```
//!
//! Closing the socket does not end the voice session; the engine is shared by every
//! client and only stops on an explicit `disconnect`.

use crate::session::{EngineNotification, EngineSnapshot, VoiceEngine};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages sent by the client.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect,
    Disconnect,
    Text { text: String },
    Ping { timestamp: u64 },
}

/// Messages sent to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status { session: EngineSnapshot },
    Transcript { text: String },
    Pong { timestamp: u64 },
    Error { code: String, message: String },
}

pub struct SessionSocket {
    engine: VoiceEngine,
    last_heartbeat: Instant,
}

impl SessionSocket {
    pub fn new(engine: VoiceEngine) -> Self {
        Self {
            engine,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize WebSocket message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_command(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let result = match message {
            ClientMessage::Connect => self.engine.connect(),
            ClientMessage::Disconnect => self.engine.disconnect(),
            ClientMessage::Text { text } => {
                if text.trim().is_empty() {
                    self.send_error(ctx, "empty_text", "Message text cannot be empty");
                    return;
                }
                self.engine.send_text_message(text)
            }
            ClientMessage::Ping { timestamp } => {
                self.send(ctx, &ServerMessage::Pong { timestamp });
                return;
            }
        };

        if let Err(e) = result {
            self.send_error(ctx, "engine_unavailable", &e.user_message());
        }
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Session WebSocket connected");

        ctx.add_stream(WatchStream::new(self.engine.watch()));
        ctx.add_stream(BroadcastStream::new(self.engine.notifications()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Session WebSocket disconnected");
    }
}

/// Snapshot changes from the engine.
impl StreamHandler<EngineSnapshot> for SessionSocket {
    fn handle(&mut self, snapshot: EngineSnapshot, ctx: &mut Self::Context) {
        self.send(ctx, &ServerMessage::Status { session: snapshot });
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Engine snapshot stream ended");
        ctx.stop();
    }
}

/// Discrete engine notifications. Status and talking changes already arrive as
/// snapshots, so only agent text is forwarded.
impl StreamHandler<Result<EngineNotification, BroadcastStreamRecvError>> for SessionSocket {
    fn handle(
        &mut self,
        item: Result<EngineNotification, BroadcastStreamRecvError>,
        ctx: &mut Self::Context,
    ) {
        match item {
            Ok(EngineNotification::TextReceived(text)) => {
                self.send(ctx, &ServerMessage::Transcript { text });
            }
            Ok(_) => {}
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("WebSocket client fell behind, {} notifications dropped", missed);
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Engine notification stream ended");
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_command(message, ctx),
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(
                    ctx,
                    "unsupported",
                    "Binary frames are not accepted; audio is captured locally",
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upgrade `GET /ws/session` to a WebSocket.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(SessionSocket::new(state.engine.clone()), &req, stream)
}
