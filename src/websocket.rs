//! # UI WebSocket
//!
//! The UI connects to `/ws/voice` to follow the voice session live and to
//! start or stop it without polling the REST endpoints.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server sends a `status` message with the current snapshot
//! 2. **Events**: every session event is pushed as `session_event`
//! 3. **Control**: the client sends `start` or `stop`; failures come back as `error`
//! 4. **Heartbeat**: the server sends `ping`, the client answers with `pong`
//!
//! ## Message Format:
//! - **Client → Server**: `{"type": "start"}`, `{"type": "stop"}`, `{"type": "pong", "timestamp": 0}`
//! - **Server → Client**: JSON tagged by `type`
//!
//! Several UI clients may be connected at once; they all see the same
//! session. Disconnecting does not stop the session.

use crate::error::VoiceError;
use crate::session::{SessionEvent, SessionSnapshot};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Messages the UI sends.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start,
    Stop,
    Pong { timestamp: u64 },
}

/// Messages pushed to the UI.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent on connect and after every control request
    Status { session: SessionSnapshot },

    SessionEvent { event: SessionEvent },

    Error { code: String, message: String },

    Ping { timestamp: u64 },
}

impl ServerMessage {
    fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                error!("Failed to serialize websocket message: {}", e);
                None
            }
        }
    }
}

/// What to push for one item of the session event stream.
fn event_message(item: Result<SessionEvent, BroadcastStreamRecvError>) -> ServerMessage {
    match item {
        Ok(event) => ServerMessage::SessionEvent { event },
        Err(BroadcastStreamRecvError::Lagged(missed)) => ServerMessage::error(
            "events_lagged",
            format!("{} session events were skipped; refresh status", missed),
        ),
    }
}

/// Error code for a failed control request
fn error_code(err: &VoiceError) -> &'static str {
    match err {
        VoiceError::SessionActive => "session_active",
        VoiceError::SessionStartFailed(_) => "start_failed",
        _ => "session_error",
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// One UI connection.
///
/// ## Actor Model:
/// The actor owns nothing of the pipeline; it forwards control requests to
/// the shared `VoiceSession` on a tokio task and relays the session's
/// broadcast events back to its socket.
pub struct VoiceSocket {
    state: AppState,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

/// A serialized message produced off the actor's context
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

impl VoiceSocket {
    pub fn new(state: AppState) -> Self {
        let config = state.get_config();
        Self {
            state,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(config.websocket.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.websocket.client_timeout_secs),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &ServerMessage) {
        if let Some(json) = msg.to_json() {
            ctx.text(json);
        }
    }

    fn handle_start(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            let reply = match state.voice.start(state.session_settings()).await {
                Ok(session) => ServerMessage::Status { session },
                Err(e) => {
                    warn!("Start requested over websocket failed: {}", e);
                    ServerMessage::error(error_code(&e), e.to_string())
                }
            };
            if let Some(json) = reply.to_json() {
                addr.do_send(SendText(json));
            }
        });
    }

    fn handle_stop(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            state.voice.stop().await;
            let reply = ServerMessage::Status {
                session: state.voice.snapshot(),
            };
            if let Some(json) = reply.to_json() {
                addr.do_send(SendText(json));
            }
        });
    }

    fn handle_client_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Start) => self.handle_start(ctx),
            Ok(ClientMessage::Stop) => self.handle_stop(ctx),
            Ok(ClientMessage::Pong { timestamp }) => {
                debug!("UI pong, round trip {}ms", now_millis().saturating_sub(timestamp));
                self.last_heartbeat = Instant::now();
            }
            Err(e) => {
                self.send(ctx, &ServerMessage::error("invalid_json", format!("Invalid JSON: {}", e)));
            }
        }
    }
}

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("UI websocket connected");
        self.state.increment_ui_connections();

        ctx.add_stream(BroadcastStream::new(self.state.voice.subscribe()));
        self.send(
            ctx,
            &ServerMessage::Status {
                session: self.state.voice.snapshot(),
            },
        );

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!("UI websocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            act.send(ctx, &ServerMessage::Ping { timestamp: now_millis() });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("UI websocket disconnected");
        self.state.decrement_ui_connections();
    }
}

/// Session events from the broadcast channel.
impl StreamHandler<Result<SessionEvent, BroadcastStreamRecvError>> for VoiceSocket {
    fn handle(&mut self, item: Result<SessionEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        let msg = event_message(item);
        self.send(ctx, &msg);
    }

    // The channel lives as long as the session; keep the socket open regardless
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// Frames from the UI.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_client_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                self.send(ctx, &ServerMessage::error("unsupported", "Binary frames are not accepted"));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("UI websocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("UI websocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// `GET /ws/voice`: upgrade to the UI websocket.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!("UI websocket request from {:?}", req.connection_info().peer_addr());
    ws::start(VoiceSocket::new(app_state.get_ref().clone()), &req, stream)
}
