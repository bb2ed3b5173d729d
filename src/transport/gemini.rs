//! # Gemini Live Client
//!
//! Opens a WebSocket to the Gemini Live API and turns it into a
//! `LiveConnection`.
//!
//! Endpoint, key and timeout come with each `SessionSetup`, so the client
//! itself holds no configuration and always uses what the current config says.
//!
//! ## Connection sequence:
//! 1. Connect to `{endpoint}?key={api_key}` (key percent-encoded)
//! 2. Send the `setup` message (model, system instruction, AUDIO responses)
//! 3. Wait for `setupComplete`. Only then is the connection open.
//! 4. Split the socket: a writer task drains the uplink channel, a reader
//!    task turns server frames into `TransportEvent`s
//!
//! The whole sequence is bounded by `connect_timeout`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::protocol::{RealtimeInputMessage, ServerMessage, SetupMessage};
use super::{LiveConnection, LiveTransport, SessionSetup, TransportEvent, UplinkMessage};
use crate::error::{VoiceError, VoiceResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Install the TLS crypto provider used for `wss://` endpoints.
///
/// Call once at startup; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Endpoint with the API key attached as a query parameter
fn connection_url(setup: &SessionSetup) -> String {
    if setup.api_key.is_empty() {
        return setup.endpoint.clone();
    }
    let separator = if setup.endpoint.contains('?') { '&' } else { '?' };
    format!(
        "{}{}key={}",
        setup.endpoint,
        separator,
        urlencoding::encode(&setup.api_key)
    )
}

/// Connects sessions to Gemini Live.
#[derive(Debug, Clone, Default)]
pub struct GeminiLiveTransport;

impl GeminiLiveTransport {
    pub fn new() -> Self {
        Self
    }

    async fn open(&self, setup: SessionSetup) -> VoiceResult<LiveConnection> {
        let (socket, _response) = connect_async(connection_url(&setup)).await?;
        let (mut sink, mut stream) = socket.split();
        debug!("Live socket connected to {}", setup.endpoint);

        let setup_message = SetupMessage::new(&setup.model, &setup.system_instruction);
        sink.send(Message::Text(serde_json::to_string(&setup_message)?))
            .await?;

        wait_for_setup(&mut stream).await?;
        info!("Live session ready (model {})", setup.model);

        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_uplink(sink, up_rx));
        tokio::spawn(read_downlink(stream, ev_tx));

        Ok(LiveConnection::new(up_tx, ev_rx))
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<LiveConnection> {
        let timeout = setup.connect_timeout;
        tokio::time::timeout(timeout, self.open(setup))
            .await
            .map_err(|_| {
                VoiceError::Transport(format!(
                    "no setup confirmation within {}s",
                    timeout.as_secs()
                ))
            })?
    }
}

/// Read until the server confirms the setup.
async fn wait_for_setup(stream: &mut SplitStream<Socket>) -> VoiceResult<()> {
    while let Some(frame) = stream.next().await {
        let payload = match frame? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(VoiceError::Transport(format!(
                    "closed during setup: {}",
                    reason
                )));
            }
            _ => continue,
        };
        let message: ServerMessage = serde_json::from_slice(&payload)?;
        if message.is_setup_complete() {
            return Ok(());
        }
        trace!("Ignoring message before setupComplete");
    }
    Err(VoiceError::ConnectionClosed)
}

/// Forward uplink messages to the socket until told to close.
async fn write_uplink(
    mut sink: SplitSink<Socket, Message>,
    mut uplink: mpsc::UnboundedReceiver<UplinkMessage>,
) {
    while let Some(message) = uplink.recv().await {
        match message {
            UplinkMessage::Audio(packet) => {
                let json = match serde_json::to_string(&RealtimeInputMessage::audio(packet)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Could not serialize uplink audio: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    debug!("Uplink send failed, stopping writer: {}", e);
                    return;
                }
            }
            UplinkMessage::Close => break,
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    debug!("Uplink writer finished");
}

/// Turn server frames into events until the socket ends.
async fn read_downlink(
    mut stream: SplitStream<Socket>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let terminal = loop {
        let payload = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(frame))) => {
                break TransportEvent::Closed {
                    reason: frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty()),
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break TransportEvent::Error(e.to_string()),
            None => break TransportEvent::Closed { reason: None },
        };

        match events_from_payload(&payload) {
            Ok(batch) => {
                for event in batch {
                    if events.send(event).is_err() {
                        // Nobody listening any more
                        return;
                    }
                }
            }
            Err(e) => warn!("Dropping unreadable server message: {}", e),
        }
    };

    debug!("Downlink reader finished: {:?}", terminal);
    let _ = events.send(terminal);
}

/// Events carried by one server message, in the order they should be handled.
pub fn events_from_payload(payload: &[u8]) -> VoiceResult<Vec<TransportEvent>> {
    let message: ServerMessage = serde_json::from_slice(payload)?;
    let mut events: Vec<TransportEvent> = message
        .audio_packets()
        .cloned()
        .map(TransportEvent::Audio)
        .collect();

    if let Some(content) = &message.server_content {
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }
    if let Some(go_away) = &message.go_away {
        warn!(
            "Live service is going away (time left: {})",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }
    Ok(events)
}
