//! # Live Transport
//!
//! The streaming connection to the remote generative AI service.
//!
//! ## Key Components:
//! - **LiveTransport**: opens connections (trait, so sessions can run against
//!   an in-memory service in tests)
//! - **LiveConnection**: an open connection. Audio goes up through
//!   `send_audio()`, events come down through `next_event()`
//! - **gemini**: the Gemini Live WebSocket client
//! - **protocol**: its JSON wire types
//!
//! ## Channel layout:
//! ```text
//! session ──UplinkMessage──▶ [writer task] ──▶ socket
//! session ◀─TransportEvent── [reader task] ◀── socket
//! ```
//! Dropping or closing the `LiveConnection` closes the uplink channel, which
//! makes the writer send a close frame and shut down.

pub mod gemini;
pub mod protocol;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::audio::codec::EncodedPacket;
use crate::error::{VoiceError, VoiceResult};

pub use gemini::GeminiLiveTransport;

/// What a session asks for when it opens a connection.
///
/// Built from the live config on every `start()`, so a changed endpoint or
/// key is picked up by the next session.
#[derive(Clone, PartialEq)]
pub struct SessionSetup {
    /// WebSocket URL of the service
    pub endpoint: String,
    pub api_key: String,
    /// Bound on connecting plus the setup handshake
    pub connect_timeout: Duration,
    /// Model identifier, without the `models/` prefix
    pub model: String,
    pub system_instruction: String,
}

// Hand-written so the key never reaches a log line
impl fmt::Debug for SessionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSetup")
            .field("endpoint", &self.endpoint)
            .field("api_key", &if self.api_key.is_empty() { "<none>" } else { "<redacted>" })
            .field("connect_timeout", &self.connect_timeout)
            .field("model", &self.model)
            .field("system_instruction", &self.system_instruction)
            .finish()
    }
}

/// Messages from the session to the connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum UplinkMessage {
    Audio(EncodedPacket),
    /// Send a close frame and stop
    Close,
}

/// Something the remote service did.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A chunk of spoken response
    Audio(EncodedPacket),
    /// The model stopped talking because the user started
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// The remote end closed the connection
    Closed { reason: Option<String> },
    /// The connection failed
    Error(String),
}

/// Opens live connections.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: lets a trait have `async fn` and still be used as
///   `dyn LiveTransport`
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Open a connection and wait until the service is ready for audio.
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<LiveConnection>;
}

/// An open streaming connection, owned by exactly one session.
#[derive(Debug)]
pub struct LiveConnection {
    uplink: Option<mpsc::UnboundedSender<UplinkMessage>>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl LiveConnection {
    pub fn new(
        uplink: mpsc::UnboundedSender<UplinkMessage>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            uplink: Some(uplink),
            events,
        }
    }

    /// Queue an audio packet for the service.
    ///
    /// Fails with `ConnectionClosed` once the connection is gone.
    pub fn send_audio(&self, packet: EncodedPacket) -> VoiceResult<()> {
        let uplink = self.uplink.as_ref().ok_or(VoiceError::ConnectionClosed)?;
        uplink
            .send(UplinkMessage::Audio(packet))
            .map_err(|_| VoiceError::ConnectionClosed)
    }

    /// Wait for the next event from the service.
    ///
    /// Returns `None` after the connection has been closed or its reader
    /// has gone away.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.uplink.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(uplink) = self.uplink.take() {
            let _ = uplink.send(UplinkMessage::Close);
            self.events.close();
            debug!("Live connection closed");
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        LiveConnection,
        mpsc::UnboundedReceiver<UplinkMessage>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        (LiveConnection::new(up_tx, ev_rx), up_rx, ev_tx)
    }

    #[test]
    fn test_setup_debug_hides_key() {
        let setup = SessionSetup {
            endpoint: "wss://host/ws".to_string(),
            api_key: "secret-123".to_string(),
            connect_timeout: Duration::from_secs(5),
            model: "m".to_string(),
            system_instruction: String::new(),
        };
        let printed = format!("{:?}", setup);
        assert!(!printed.contains("secret-123"));
        assert!(printed.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (mut conn, mut up_rx, ev_tx) = pair();

        let packet = EncodedPacket::from_samples(&[0.0; 4], 16000);
        conn.send_audio(packet.clone()).unwrap();
        assert_eq!(up_rx.recv().await, Some(UplinkMessage::Audio(packet)));

        ev_tx.send(TransportEvent::TurnComplete).unwrap();
        assert_eq!(conn.next_event().await, Some(TransportEvent::TurnComplete));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut conn, mut up_rx, _ev_tx) = pair();
        conn.close();
        conn.close();

        assert_eq!(up_rx.recv().await, Some(UplinkMessage::Close));
        assert_eq!(up_rx.recv().await, None);
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send_audio(EncodedPacket::from_samples(&[], 16000)),
            Err(VoiceError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_fails_when_writer_is_gone() {
        let (conn, up_rx, _ev_tx) = pair();
        drop(up_rx);
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send_audio(EncodedPacket::from_samples(&[0.0], 16000)),
            Err(VoiceError::ConnectionClosed)
        ));
    }
}
