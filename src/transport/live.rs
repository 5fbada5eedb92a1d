//! # Live Transport
//!
//! WebSocket implementation of [`Transport`] for a Gemini-Live style bidirectional
//! streaming endpoint.
//!
//! ## Protocol:
//! - **Client → server**: `setup` once, then `realtimeInput` (base64 PCM chunks)
//!   and `clientContent` (text turns)
//! - **Server → client**: `setupComplete`, then `serverContent` carrying model audio,
//!   text, and the `interrupted` flag
//!
//! ## Tasks:
//! Each open session runs a writer task fed by an unbounded queue, so sends never
//! wait on the network, and a reader task that turns server frames into
//! [`TransportEvent`]s.

use crate::audio::codec::AudioPayload;
use crate::transport::{
    EventSink, SessionConfig, Transport, TransportError, TransportEvent, TransportHandle,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Client-to-server messages
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Content>,
    turn_complete: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

/// Server-to-client messages. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<Content>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

impl Setup {
    fn from_config(config: &SessionConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: Some(config.instruction.clone()),
                    inline_data: None,
                }],
            },
        }
    }
}

fn encode_message(message: &ClientMessage) -> Result<Message, TransportError> {
    serde_json::to_string(message)
        .map(Message::Text)
        .map_err(|e| TransportError::Send(e.to_string()))
}

/// Turn one server message into engine events, in the order the engine should see
/// them: readiness, then audio and text, then interruption.
fn translate(message: ServerMessage) -> Vec<TransportEvent> {
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(TransportEvent::Opened);
    }

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for part in parts {
            if let Some(blob) = part.inline_data {
                match STANDARD.decode(blob.data.as_bytes()) {
                    Ok(data) => events.push(TransportEvent::AudioReceived(AudioPayload::new(
                        blob.mime_type,
                        data,
                    ))),
                    Err(e) => tracing::warn!("Dropping audio part with invalid base64: {}", e),
                }
            }
            if let Some(text) = part.text {
                if !text.is_empty() {
                    events.push(TransportEvent::TextReceived(text));
                }
            }
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            tracing::trace!("Agent turn complete");
        }
    }

    if let Some(go_away) = message.go_away {
        tracing::warn!(
            "Server is about to close the session (time left: {})",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }

    events
}

fn handle_frame(bytes: &[u8], events: &EventSink) {
    match serde_json::from_slice::<ServerMessage>(bytes) {
        Ok(message) => {
            for event in translate(message) {
                events.emit(event);
            }
        }
        Err(e) => tracing::warn!("Ignoring unparseable server message: {}", e),
    }
}

async fn read_loop<S>(mut stream: S, events: EventSink)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(text.as_bytes(), &events),
            Ok(Message::Binary(bytes)) => handle_frame(&bytes, &events),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty());
                events.emit(TransportEvent::Closed(reason));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                events.emit(TransportEvent::Error(e.to_string()));
                return;
            }
        }
    }
    events.emit(TransportEvent::Closed(None));
}

async fn write_loop<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            tracing::debug!("Writer stopped: {}", e);
            return;
        }
        if closing {
            return;
        }
    }
}

/// Transport speaking the live-audio WebSocket protocol.
#[derive(Debug, Clone)]
pub struct LiveTransport {
    endpoint: String,
}

impl LiveTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

/// Endpoint URL carrying the credential as a percent-encoded `key` parameter.
fn session_url(endpoint: &str, api_key: &str) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}key={}", endpoint, separator, urlencoding::encode(api_key))
}

impl Default for LiveTransport {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

impl Transport for LiveTransport {
    fn open(
        &self,
        config: SessionConfig,
        events: EventSink,
    ) -> BoxFuture<'static, Result<Box<dyn TransportHandle>, TransportError>> {
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            let url = session_url(&endpoint, &config.api_key);
            tracing::info!("Opening live session on {} (model {})", endpoint, config.model);

            let (socket, _response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Open(e.to_string()))?;
            let (mut write, read) = socket.split();

            let setup = encode_message(&ClientMessage::Setup(Setup::from_config(&config)))?;
            write
                .send(setup)
                .await
                .map_err(|e| TransportError::Open(e.to_string()))?;

            let (outbound, queue) = mpsc::unbounded_channel();
            let writer = tokio::spawn(write_loop(write, queue));
            let reader = tokio::spawn(read_loop(read, events));

            let link: Box<dyn TransportHandle> = Box::new(LiveLink {
                outbound,
                reader,
                writer,
                closed: false,
            });
            Ok(link)
        })
    }
}

/// An open live session.
struct LiveLink {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    closed: bool,
}

impl LiveLink {
    fn enqueue(&self, message: &ClientMessage) -> Result<(), TransportError> {
        if self.closed || self.writer.is_finished() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(encode_message(message)?)
            .map_err(|_| TransportError::Closed)
    }
}

impl TransportHandle for LiveLink {
    fn send_audio(&mut self, payload: AudioPayload) -> Result<(), TransportError> {
        self.enqueue(&ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: payload.mime_type,
                data: STANDARD.encode(&payload.data),
            }],
        }))
    }

    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.enqueue(&ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(text.to_string()),
                    inline_data: None,
                }],
            }],
            turn_complete: true,
        }))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reader.abort();
        tracing::debug!("Live session closed");
        self.outbound
            .send(Message::Close(None))
            .map_err(|_| TransportError::Closed)
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::PcmFormat;
    use futures_util::stream;
    use std::sync::{Arc, Mutex};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    fn session_config() -> SessionConfig {
        SessionConfig {
            model: "gemini-live".to_string(),
            api_key: "secret".to_string(),
            voice_name: "Zephyr".to_string(),
            instruction: "Be brief.".to_string(),
            input_format: PcmFormat::outbound(),
            output_format: PcmFormat::inbound(),
        }
    }

    fn recording_sink() -> (EventSink, Arc<Mutex<Vec<TransportEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink = EventSink::new(move |event| sink_seen.lock().unwrap().push(event));
        (sink, seen)
    }

    #[test]
    fn test_setup_message_shape() {
        let message = ClientMessage::Setup(Setup::from_config(&session_config()));
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["setup"]["model"], "models/gemini-live");
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Zephyr"
        );
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "Be brief.");
    }

    #[test]
    fn test_session_url_escapes_the_key() {
        assert_eq!(
            session_url("wss://live.example/ws", "abc+/=&x y"),
            "wss://live.example/ws?key=abc%2B%2F%3D%26x%20y"
        );
        assert_eq!(
            session_url("wss://live.example/ws?alt=json", "plain"),
            "wss://live.example/ws?alt=json&key=plain"
        );
    }

    #[test]
    fn test_realtime_input_is_base64() {
        let message = ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: "audio/pcm;rate=16000".to_string(),
                data: STANDARD.encode([0x01u8, 0x02]),
            }],
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["realtimeInput"]["mediaChunks"][0]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["realtimeInput"]["mediaChunks"][0]["data"], "AQI=");
    }

    #[test]
    fn test_translate_audio_then_interrupt() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAAQA==" } },
                    { "text": "Namaste" }
                ]},
                "interrupted": true
            }
        }"#;
        let message: ServerMessage = serde_json::from_str(raw).unwrap();
        let events = translate(message);

        assert_eq!(
            events,
            vec![
                TransportEvent::AudioReceived(AudioPayload::new(
                    "audio/pcm;rate=24000",
                    vec![0x00, 0x00, 0x00, 0x40]
                )),
                TransportEvent::TextReceived("Namaste".to_string()),
                TransportEvent::Interrupted,
            ]
        );
    }

    #[test]
    fn test_translate_setup_complete() {
        let message: ServerMessage = serde_json::from_str(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(translate(message), vec![TransportEvent::Opened]);
    }

    #[test]
    fn test_translate_skips_bad_base64() {
        let raw = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"%%%"}}]}}}"#;
        let message: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(translate(message).is_empty());
    }

    #[tokio::test]
    async fn test_read_loop_reports_close_reason() {
        let frames = vec![
            Ok(Message::Binary(br#"{"setupComplete":{}}"#.to_vec())),
            Ok(Message::Text("not json".to_string())),
            Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "session expired".into(),
            }))),
        ];
        let (sink, seen) = recording_sink();

        read_loop(stream::iter(frames), sink).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TransportEvent::Opened,
                TransportEvent::Closed(Some("session expired".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_loop_reports_errors() {
        let frames = vec![Err(tungstenite::Error::ConnectionClosed)];
        let (sink, seen) = recording_sink();

        read_loop(stream::iter(frames), sink).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], TransportEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_read_loop_end_of_stream_is_close() {
        let frames: Vec<Result<Message, tungstenite::Error>> = Vec::new();
        let (sink, seen) = recording_sink();

        read_loop(stream::iter(frames), sink).await;

        assert_eq!(*seen.lock().unwrap(), vec![TransportEvent::Closed(None)]);
    }
}
