//! # Voice Session
//!
//! Ties the microphone, the live connection and the playback scheduler
//! together, and exposes the small state machine the UI watches.
//!
//! ## States:
//! ```text
//! Idle ──start()──▶ Connecting ──open──▶ Listening ◀──▶ Speaking
//!  ▲                    │                    │              │
//!  └────────────────────┴──── stop() / remote close / error ┘
//! ```
//! - **Listening → Speaking**: a downlink audio packet was scheduled
//! - **Speaking → Listening**: the last in-flight buffer finished playing,
//!   or the service interrupted the model
//!
//! ## Epochs:
//! Every `start()`, `stop()` and remote teardown bumps the session epoch.
//! All state changes go through `transition()`/`finish()`, which compare the
//! caller's epoch with the current one, so work that finishes after the
//! session was stopped cannot touch the next one.
//!
//! ## Concurrency:
//! Each started session runs one driver task that owns the capture stream
//! and the connection and `select!`s over:
//! - captured frames (encoded and sent in order)
//! - transport events (downlink audio, interruption, close)
//! - playback completions (routed from the output device's thread)
//! - cancellation from `stop()`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::audio::capture::{AudioFrame, AudioInput, CaptureConfig, CaptureStream};
use crate::audio::codec::EncodedPacket;
use crate::audio::playback::{BufferId, PlaybackBuffer, PlaybackScheduler};
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::transport::{LiveConnection, LiveTransport, SessionSetup, TransportEvent};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Speaking,
}

impl SessionState {
    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Listening)
                | (Connecting, Idle)
                | (Listening, Speaking)
                | (Speaking, Listening)
                | (Listening, Idle)
                | (Speaking, Idle)
        )
    }

    pub fn is_active(self) -> bool {
        self != SessionState::Idle
    }
}

/// Something the UI may want to know about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        session_id: Option<Uuid>,
        epoch: u64,
        from: SessionState,
        to: SessionState,
        timestamp: DateTime<Utc>,
    },
    /// Degraded but still running (dropped packet, capture backlog)
    Warning {
        session_id: Option<Uuid>,
        epoch: u64,
        message: String,
    },
    /// The session failed; shown to the user as an alert
    Error {
        session_id: Option<Uuid>,
        epoch: u64,
        message: String,
    },
    Stopped {
        session_id: Option<Uuid>,
        epoch: u64,
        reason: String,
    },
}

/// Per-session counters, following the shape of the HTTP metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub buffers_scheduled: u64,
    pub interruptions: u64,
    pub backpressure_warnings: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// Point-in-time view for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub epoch: u64,
    pub session_id: Option<Uuid>,
    pub stats: SessionStats,
    pub in_flight_buffers: usize,
    pub next_start_time: f64,
}

/// What a session is started with. Read from config on every `start()`.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub capture: CaptureConfig,
    pub setup: SessionSetup,
    /// Rate assumed for downlink packets whose descriptor has none
    pub playback_sample_rate: u32,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            capture: config.audio.to_capture_config(),
            setup: SessionSetup {
                endpoint: config.live.endpoint.clone(),
                api_key: config.live.api_key.clone(),
                connect_timeout: Duration::from_secs(config.live.connect_timeout_secs),
                model: config.live.model.clone(),
                system_instruction: config.live.system_instruction.clone(),
            },
            playback_sample_rate: config.audio.playback_sample_rate,
        }
    }
}

/// Why a driver stopped
#[derive(Debug)]
enum StopCause {
    /// `stop()` asked for it; `stop()` finishes the teardown
    Cancelled,
    RemoteClosed(Option<String>),
    Failed(String),
}

struct Lifecycle {
    state: SessionState,
    epoch: u64,
    session_id: Option<Uuid>,
    stats: SessionStats,
    cancel: Option<watch::Sender<bool>>,
    driver: Option<JoinHandle<()>>,
}

/// State shared between the session handle and its driver task
struct Shared {
    input: Arc<dyn AudioInput>,
    transport: Arc<dyn LiveTransport>,
    scheduler: Arc<PlaybackScheduler>,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<SessionEvent>,
}

/// The voice session handle.
///
/// One instance owns the microphone and the connection while a session is
/// running; it is created once and handed to whoever drives it.
pub struct VoiceSession {
    shared: Arc<Shared>,
    /// Serializes `start()` and `stop()` against each other
    control: tokio::sync::Mutex<()>,
}

impl VoiceSession {
    pub fn new(
        input: Arc<dyn AudioInput>,
        transport: Arc<dyn LiveTransport>,
        scheduler: Arc<PlaybackScheduler>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                input,
                transport,
                scheduler,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Idle,
                    epoch: 0,
                    session_id: None,
                    stats: SessionStats::default(),
                    cancel: None,
                    driver: None,
                }),
                events,
            }),
            control: tokio::sync::Mutex::new(()),
        }
    }

    /// Acquire the microphone, open the live connection, and start streaming.
    ///
    /// Resolves once the session is `Listening`. Fails with `SessionActive`
    /// if a session is already running, and with `SessionStartFailed` if the
    /// microphone or the connection could not be opened (or `stop()` was
    /// called first); the state is `Idle` again in that case.
    pub async fn start(&self, settings: SessionSettings) -> VoiceResult<SessionSnapshot> {
        let ready = {
            let _control = self.control.lock().await;
            let mut lc = self.shared.lifecycle.lock().unwrap();
            if lc.state.is_active() {
                return Err(VoiceError::SessionActive);
            }

            lc.epoch += 1;
            let epoch = lc.epoch;
            let session_id = Uuid::new_v4();
            lc.session_id = Some(session_id);
            lc.stats = SessionStats {
                started_at: Some(Utc::now()),
                ..SessionStats::default()
            };
            self.shared.set_state(&mut lc, SessionState::Connecting);

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();
            let driver = tokio::spawn(run_driver(
                self.shared.clone(),
                settings,
                epoch,
                cancel_rx,
                ready_tx,
            ));
            lc.cancel = Some(cancel_tx);
            lc.driver = Some(driver);

            info!(session_id = %session_id, epoch, "Voice session starting");
            ready_rx
        };

        match ready.await {
            Ok(Ok(())) => Ok(self.snapshot()),
            Ok(Err(e)) => Err(VoiceError::start_failed(e)),
            // Driver went away without an answer: stopped while connecting
            Err(_) => Err(VoiceError::start_failed(VoiceError::Cancelled)),
        }
    }

    /// Stop streaming, release the microphone and the connection, and cut
    /// off any audio still playing. Safe to call from any state, any number
    /// of times.
    pub async fn stop(&self) {
        let _control = self.control.lock().await;

        let (cancel, driver) = {
            let mut lc = self.shared.lifecycle.lock().unwrap();
            // Anything still in flight for the old epoch is now stale
            lc.epoch += 1;
            (lc.cancel.take(), lc.driver.take())
        };

        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!("Voice session driver ended abnormally: {}", e);
            }
        }

        self.shared.scheduler.clear();

        let mut lc = self.shared.lifecycle.lock().unwrap();
        if lc.state.is_active() {
            self.shared.set_state(&mut lc, SessionState::Idle);
            self.shared.emit(SessionEvent::Stopped {
                session_id: lc.session_id,
                epoch: lc.epoch,
                reason: "stopped".to_string(),
            });
            info!(session_id = ?lc.session_id, epoch = lc.epoch, "Voice session stopped");
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.lock().unwrap().state
    }

    #[cfg(test)]
    pub fn epoch(&self) -> u64 {
        self.shared.lifecycle.lock().unwrap().epoch
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let lc = self.shared.lifecycle.lock().unwrap();
        SessionSnapshot {
            state: lc.state,
            epoch: lc.epoch,
            session_id: lc.session_id,
            stats: lc.stats.clone(),
            in_flight_buffers: self.shared.scheduler.in_flight(),
            next_start_time: self.shared.scheduler.next_start_time(),
        }
    }

    /// Receive session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Apply a state change with the lifecycle already locked.
    fn set_state(&self, lc: &mut Lifecycle, to: SessionState) {
        let from = lc.state;
        if from == to {
            return;
        }
        lc.state = to;
        info!(session_id = ?lc.session_id, epoch = lc.epoch, "Voice session {:?} -> {:?}", from, to);
        self.emit(SessionEvent::StateChanged {
            session_id: lc.session_id,
            epoch: lc.epoch,
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    /// The single entry point for state changes made by the driver.
    ///
    /// Returns `false` when `epoch` is stale or the edge is not allowed.
    fn transition(&self, epoch: u64, to: SessionState) -> bool {
        let mut lc = self.lifecycle.lock().unwrap();
        if lc.epoch != epoch {
            trace!("Ignoring {:?} from stale epoch {} (now {})", to, epoch, lc.epoch);
            return false;
        }
        if lc.state == to {
            return true;
        }
        if !lc.state.can_transition_to(to) {
            warn!("Refusing illegal transition {:?} -> {:?}", lc.state, to);
            return false;
        }
        self.set_state(&mut lc, to);
        true
    }

    /// End the session from inside the driver (remote close or failure).
    fn finish(&self, epoch: u64, cause: &StopCause) -> bool {
        let mut lc = self.lifecycle.lock().unwrap();
        if lc.epoch != epoch {
            return false;
        }
        lc.epoch += 1;
        lc.cancel = None;

        let reason = match cause {
            StopCause::Cancelled => "stopped".to_string(),
            StopCause::RemoteClosed(Some(reason)) => format!("connection closed: {}", reason),
            StopCause::RemoteClosed(None) => "connection closed".to_string(),
            StopCause::Failed(message) => {
                self.emit(SessionEvent::Error {
                    session_id: lc.session_id,
                    epoch,
                    message: message.clone(),
                });
                message.clone()
            }
        };

        self.set_state(&mut lc, SessionState::Idle);
        info!(session_id = ?lc.session_id, epoch, "Voice session ended: {}", reason);
        self.emit(SessionEvent::Stopped {
            session_id: lc.session_id,
            epoch: lc.epoch,
            reason,
        });
        true
    }

    /// Update stats for the live epoch only.
    fn record(&self, epoch: u64, update: impl FnOnce(&mut SessionStats)) {
        let mut lc = self.lifecycle.lock().unwrap();
        if lc.epoch == epoch {
            update(&mut lc.stats);
        }
    }

    fn warn(&self, epoch: u64, message: String) {
        let session_id = {
            let lc = self.lifecycle.lock().unwrap();
            if lc.epoch != epoch {
                return;
            }
            lc.session_id
        };
        warn!(session_id = ?session_id, epoch, "{}", message);
        self.emit(SessionEvent::Warning {
            session_id,
            epoch,
            message,
        });
    }
}

/// Open the microphone off the async threads; device setup can block.
async fn open_capture(input: Arc<dyn AudioInput>, config: CaptureConfig) -> VoiceResult<CaptureStream> {
    tokio::task::spawn_blocking(move || CaptureStream::open(input.as_ref(), &config))
        .await
        .map_err(|e| VoiceError::DeviceUnavailable(format!("capture setup panicked: {}", e)))?
}

async fn run_driver(
    shared: Arc<Shared>,
    settings: SessionSettings,
    epoch: u64,
    mut cancel: watch::Receiver<bool>,
    ready: oneshot::Sender<VoiceResult<()>>,
) {
    let mut capture = match open_capture(shared.input.clone(), settings.capture.clone()).await {
        Ok(capture) => capture,
        Err(e) => {
            shared.finish(epoch, &StopCause::Failed(e.to_string()));
            let _ = ready.send(Err(e));
            return;
        }
    };

    let connecting = shared.transport.connect(settings.setup.clone());
    let mut connection = tokio::select! {
        _ = cancel.changed() => {
            // Dropping `ready` tells start() it was cancelled
            capture.close();
            return;
        }
        result = connecting => match result {
            Ok(connection) => connection,
            Err(e) => {
                capture.close();
                shared.finish(epoch, &StopCause::Failed(e.to_string()));
                let _ = ready.send(Err(e));
                return;
            }
        },
    };

    if !shared.transition(epoch, SessionState::Listening) {
        connection.close();
        capture.close();
        return;
    }
    let _ = ready.send(Ok(()));

    let cause = pump(&shared, &settings, epoch, &mut capture, &mut connection, &mut cancel).await;

    capture.close();
    connection.close();
    if !matches!(cause, StopCause::Cancelled) {
        shared.scheduler.clear();
        shared.finish(epoch, &cause);
    }
    debug!(epoch, "Voice session driver exiting: {:?}", cause);
}

/// Run both legs until something ends the session.
async fn pump(
    shared: &Arc<Shared>,
    settings: &SessionSettings,
    epoch: u64,
    capture: &mut CaptureStream,
    connection: &mut LiveConnection,
    cancel: &mut watch::Receiver<bool>,
) -> StopCause {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<BufferId>();

    loop {
        tokio::select! {
            biased;

            _ = cancel.changed() => return StopCause::Cancelled,

            Some(id) = done_rx.recv() => {
                if shared.scheduler.complete(id) {
                    shared.transition(epoch, SessionState::Listening);
                }
            }

            event = connection.next_event() => match event {
                Some(TransportEvent::Audio(packet)) => play(shared, settings, epoch, packet, &done_tx),
                Some(TransportEvent::Interrupted) => {
                    let cut = shared.scheduler.clear();
                    shared.record(epoch, |s| s.interruptions += 1);
                    debug!(epoch, "Interrupted, cut {} buffers", cut);
                    shared.transition(epoch, SessionState::Listening);
                }
                Some(TransportEvent::TurnComplete) => trace!(epoch, "Turn complete"),
                Some(TransportEvent::Closed { reason }) => return StopCause::RemoteClosed(reason),
                Some(TransportEvent::Error(e)) => return StopCause::Failed(format!("connection error: {}", e)),
                None => return StopCause::RemoteClosed(None),
            },

            frame = capture.next_frame() => match frame {
                Some(frame) => {
                    if let Err(e) = forward(shared, epoch, capture, connection, frame) {
                        if *cancel.borrow() {
                            return StopCause::Cancelled;
                        }
                        return StopCause::Failed(format!("uplink failed: {}", e));
                    }
                }
                None => return StopCause::Failed("capture device stopped".to_string()),
            },
        }
    }
}

/// Encode one captured frame and send it up.
fn forward(
    shared: &Shared,
    epoch: u64,
    capture: &mut CaptureStream,
    connection: &LiveConnection,
    frame: AudioFrame,
) -> VoiceResult<()> {
    let packet = frame.encode(capture.config().sample_rate);
    let bytes = frame.samples.len() as u64 * 2;
    connection.send_audio(packet)?;
    shared.record(epoch, |s| {
        s.frames_sent += 1;
        s.bytes_sent += bytes;
    });
    trace!(epoch, seq = frame.seq, "Sent frame");

    if let Err(e) = capture.check_backlog() {
        shared.record(epoch, |s| s.backpressure_warnings += 1);
        shared.warn(epoch, e.to_string());
    }
    Ok(())
}

/// Decode a downlink packet and queue it for playback.
fn play(
    shared: &Arc<Shared>,
    settings: &SessionSettings,
    epoch: u64,
    packet: EncodedPacket,
    done_tx: &mpsc::UnboundedSender<BufferId>,
) {
    shared.record(epoch, |s| s.packets_received += 1);

    let expected = shared.scheduler.output_sample_rate();
    let rate = packet.sample_rate().unwrap_or(settings.playback_sample_rate);
    let decoded = if rate != expected {
        Err(VoiceError::UnsupportedSampleRate { got: rate, expected })
    } else {
        packet.decode(rate, 1)
    };

    let buffer = match decoded {
        Ok(audio) => PlaybackBuffer::from_decoded(audio),
        Err(e) => {
            // Bad packets are dropped; state and schedule stay as they were
            shared.record(epoch, |s| s.packets_dropped += 1);
            shared.warn(epoch, format!("dropped downlink packet: {}", e));
            return;
        }
    };
    if buffer.is_empty() {
        return;
    }

    if !shared.transition(epoch, SessionState::Speaking) {
        return;
    }

    let done = done_tx.clone();
    match shared.scheduler.schedule(buffer, move |id| {
        let _ = done.send(id);
    }) {
        Ok(scheduled) => {
            shared.record(epoch, |s| s.buffers_scheduled += 1);
            trace!(epoch, "Buffer {} at {:.3}s", scheduled.id, scheduled.start_time);
        }
        Err(e) => {
            shared.record(epoch, |s| s.packets_dropped += 1);
            shared.warn(epoch, format!("speaker refused buffer: {}", e));
            if !shared.scheduler.is_playing() {
                shared.transition(epoch, SessionState::Listening);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::AudioFrameCodec;
    use crate::testing::{eventually, ConnectBehavior, FakeTransport, ManualClockOutput, ScriptedInput};

    struct Harness {
        session: Arc<VoiceSession>,
        input: ScriptedInput,
        transport: FakeTransport,
        output: Arc<ManualClockOutput>,
    }

    fn harness(behavior: ConnectBehavior) -> Harness {
        harness_with_input(behavior, ScriptedInput::new())
    }

    fn harness_with_input(behavior: ConnectBehavior, input: ScriptedInput) -> Harness {
        let transport = FakeTransport::new(behavior);
        let output = Arc::new(ManualClockOutput::new(24000));
        let scheduler = Arc::new(PlaybackScheduler::new(output.clone()));
        let session = Arc::new(VoiceSession::new(
            Arc::new(input.clone()),
            Arc::new(transport.clone()),
            scheduler,
            64,
        ));
        Harness {
            session,
            input,
            transport,
            output,
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings::from_config(&AppConfig::default())
    }

    fn half_second_packet() -> EncodedPacket {
        EncodedPacket::from_samples(&vec![0.25; 12000], 24000)
    }

    #[test]
    fn test_state_machine_edges() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Idle));
        assert!(Listening.can_transition_to(Speaking));
        assert!(Speaking.can_transition_to(Listening));
        assert!(Speaking.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Listening));
        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Connecting.can_transition_to(Speaking));
    }

    #[tokio::test]
    async fn test_start_opens_mic_and_connection() {
        let h = harness(ConnectBehavior::Open);
        let mut events = h.session.subscribe();

        let snapshot = h.session.start(settings()).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Listening);
        assert!(snapshot.session_id.is_some());
        assert!(h.input.is_open());
        assert!(h.transport.is_connected());

        let setup = h.transport.last_setup().unwrap();
        assert_eq!(setup.model, "gemini-2.5-flash-native-audio-preview-09-2025");
        assert_eq!(setup.system_instruction, "You are MantraChat via voice. Be helpful.");

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged { from, to, .. } = event {
                transitions.push((from, to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (SessionState::Idle, SessionState::Connecting),
                (SessionState::Connecting, SessionState::Listening),
            ]
        );

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_three_frames_forwarded_in_order() {
        let h = harness(ConnectBehavior::Open);
        h.session.start(settings()).await.unwrap();

        for k in 1..=3 {
            assert!(h.input.feed(&vec![k as f32 * 0.125; 4096]));
        }
        assert!(eventually(|| h.transport.uplink().len() == 3).await);

        let uplink = h.transport.uplink();
        for (k, packet) in uplink.iter().enumerate() {
            assert_eq!(packet.mime_type, "audio/pcm;rate=16000");
            let bytes = packet.pcm_bytes().unwrap();
            assert_eq!(bytes.len(), 4096 * 2);
            let decoded = AudioFrameCodec::decode(&bytes, 16000, 1).unwrap();
            assert!(decoded.channels[0].iter().all(|&s| s == (k + 1) as f32 * 0.125));
        }
        assert_eq!(h.session.snapshot().stats.frames_sent, 3);

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_downlink_speaks_then_listens() {
        let h = harness(ConnectBehavior::Open);
        h.output.set_time(10.0);
        h.session.start(settings()).await.unwrap();

        h.transport.emit(TransportEvent::Audio(half_second_packet()));
        h.transport.emit(TransportEvent::Audio(half_second_packet()));
        assert!(eventually(|| h.output.started_at().len() == 2).await);

        let starts: Vec<f64> = h.output.started_at().iter().map(|(_, t)| *t).collect();
        assert_eq!(starts, vec![10.0, 10.5]);
        assert_eq!(h.session.state(), SessionState::Speaking);
        assert_eq!(h.session.snapshot().next_start_time, 11.0);

        // First buffer done, second still playing
        let (first, _) = h.output.started_at()[0];
        h.output.finish(first);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(h.session.state(), SessionState::Speaking);

        h.output.finish_all();
        assert!(eventually(|| h.session.state() == SessionState::Listening).await);
        assert_eq!(h.session.snapshot().in_flight_buffers, 0);

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped() {
        let h = harness(ConnectBehavior::Open);
        h.output.set_time(10.0);
        h.session.start(settings()).await.unwrap();

        h.transport.emit(TransportEvent::Audio(half_second_packet()));
        assert!(eventually(|| h.output.started_at().len() == 1).await);
        let before = h.session.snapshot();

        h.transport
            .emit(TransportEvent::Audio(EncodedPacket::from_pcm_bytes(&[1, 2, 3, 4, 5], 24000)));
        assert!(eventually(|| h.session.snapshot().stats.packets_dropped == 1).await);

        let after = h.session.snapshot();
        assert_eq!(after.state, SessionState::Speaking);
        assert_eq!(after.next_start_time, before.next_start_time);
        assert_eq!(after.in_flight_buffers, before.in_flight_buffers);
        assert_eq!(h.output.started_at().len(), 1);

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_packet_while_listening_keeps_listening() {
        let h = harness(ConnectBehavior::Open);
        let mut events = h.session.subscribe();
        h.session.start(settings()).await.unwrap();

        h.transport
            .emit(TransportEvent::Audio(EncodedPacket::from_pcm_bytes(&[0; 5], 24000)));
        assert!(eventually(|| h.session.snapshot().stats.packets_dropped == 1).await);
        assert_eq!(h.session.state(), SessionState::Listening);

        let mut warned = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Warning { message, .. } = event {
                warned |= message.contains("malformed");
            }
        }
        assert!(warned);

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_capture_backlog_warns_but_keeps_listening() {
        let h = harness(ConnectBehavior::Pending);
        let mut events = h.session.subscribe();

        let session = h.session.clone();
        let starting = tokio::spawn(async move { session.start(settings()).await });
        assert!(eventually(|| h.input.is_open()).await);

        // Eight frames pile up while the connection is still being set up
        for _ in 0..8 {
            assert!(h.input.feed(&vec![0.1; 4096]));
        }
        h.transport.release();
        starting.await.unwrap().unwrap();

        assert!(eventually(|| h.session.snapshot().stats.frames_sent == 8).await);
        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.state, SessionState::Listening);
        assert_eq!(snapshot.stats.backpressure_warnings, 1);
        assert_eq!(h.transport.uplink().len(), 8);

        let mut warnings = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Warning { message, .. } = event {
                warnings.push(message);
            }
        }
        assert_eq!(
            warnings,
            vec!["capture backlog of 7 frames exceeds the limit of 4".to_string()]
        );

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_rate_packet_is_dropped() {
        let h = harness(ConnectBehavior::Open);
        h.session.start(settings()).await.unwrap();

        h.transport
            .emit(TransportEvent::Audio(EncodedPacket::from_samples(&[0.0; 160], 16000)));
        assert!(eventually(|| h.session.snapshot().stats.packets_dropped == 1).await);
        assert_eq!(h.session.state(), SessionState::Listening);
        assert!(h.output.started_at().is_empty());

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_interruption_cuts_playback() {
        let h = harness(ConnectBehavior::Open);
        h.session.start(settings()).await.unwrap();

        h.transport.emit(TransportEvent::Audio(half_second_packet()));
        h.transport.emit(TransportEvent::Audio(half_second_packet()));
        assert!(eventually(|| h.output.started_at().len() == 2).await);

        h.transport.emit(TransportEvent::Interrupted);
        assert!(eventually(|| h.session.state() == SessionState::Listening).await);
        assert_eq!(h.output.stopped().len(), 2);
        assert_eq!(h.session.snapshot().in_flight_buffers, 0);
        assert_eq!(h.session.snapshot().stats.interruptions, 1);
    }

    #[tokio::test]
    async fn test_stop_before_open_ends_idle_with_mic_released() {
        let h = harness(ConnectBehavior::Pending);

        let session = h.session.clone();
        let starting = tokio::spawn(async move { session.start(settings()).await });

        assert!(eventually(|| h.transport.connects() == 1 && h.input.is_open()).await);
        assert_eq!(h.session.state(), SessionState::Connecting);

        h.session.stop().await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.input.is_open());
        assert_eq!(h.input.closes(), 1);

        let result = starting.await.unwrap();
        match result {
            Err(VoiceError::SessionStartFailed(cause)) => {
                assert!(matches!(*cause, VoiceError::Cancelled))
            }
            other => panic!("expected cancelled start, got {other:?}"),
        }

        // A late connection must not revive the session
        h.transport.release();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_double_stop_is_idempotent() {
        let h = harness(ConnectBehavior::Open);
        let mut events = h.session.subscribe();
        h.session.start(settings()).await.unwrap();

        h.session.stop().await;
        let epoch = h.session.epoch();
        h.session.stop().await;

        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.input.opens(), 1);
        assert_eq!(h.input.closes(), 1);
        assert!(eventually(|| h.transport.close_messages() == 1).await);
        assert!(h.session.epoch() > epoch);

        let stops = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SessionEvent::Stopped { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_a_no_op() {
        let h = harness(ConnectBehavior::Open);
        h.session.stop().await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.input.opens(), 0);
    }

    #[tokio::test]
    async fn test_missing_mic_fails_start() {
        let h = harness_with_input(ConnectBehavior::Open, ScriptedInput::unavailable("denied"));
        let mut events = h.session.subscribe();

        let result = h.session.start(settings()).await;
        match result {
            Err(VoiceError::SessionStartFailed(cause)) => {
                assert!(matches!(*cause, VoiceError::DeviceUnavailable(_)))
            }
            other => panic!("expected start failure, got {other:?}"),
        }
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.transport.connects(), 0);

        let alerted = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, SessionEvent::Error { .. }));
        assert!(alerted);
    }

    #[tokio::test]
    async fn test_connection_failure_releases_mic() {
        let h = harness(ConnectBehavior::Fail("refused".to_string()));

        let result = h.session.start(settings()).await;
        assert!(matches!(result, Err(VoiceError::SessionStartFailed(_))));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.input.is_open());
        assert_eq!(h.input.closes(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_acts_like_stop() {
        let h = harness(ConnectBehavior::Open);
        let mut events = h.session.subscribe();
        h.session.start(settings()).await.unwrap();
        let epoch = h.session.epoch();

        h.transport.emit(TransportEvent::Audio(half_second_packet()));
        assert!(eventually(|| h.output.started_at().len() == 1).await);

        h.transport.emit(TransportEvent::Closed {
            reason: Some("bye".to_string()),
        });
        assert!(eventually(|| h.session.state() == SessionState::Idle).await);
        assert!(eventually(|| !h.input.is_open()).await);
        assert_eq!(h.output.stopped().len(), 1);
        assert!(h.session.epoch() > epoch);

        let reason = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
            SessionEvent::Stopped { reason, .. } => Some(reason),
            _ => None,
        });
        assert_eq!(reason.as_deref(), Some("connection closed: bye"));

        // Nothing left to do, but stop() still works
        h.session.stop().await;
        assert_eq!(h.input.closes(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_alerts_and_stops() {
        let h = harness(ConnectBehavior::Open);
        let mut events = h.session.subscribe();
        h.session.start(settings()).await.unwrap();

        h.transport.emit(TransportEvent::Error("reset".to_string()));
        assert!(eventually(|| h.session.state() == SessionState::Idle).await);

        let alerted = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, SessionEvent::Error { message, .. } if message.contains("reset")));
        assert!(alerted);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let h = harness(ConnectBehavior::Open);
        h.session.start(settings()).await.unwrap();

        assert!(matches!(
            h.session.start(settings()).await,
            Err(VoiceError::SessionActive)
        ));
        assert_eq!(h.input.opens(), 1);

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let h = harness(ConnectBehavior::Open);
        let first = h.session.start(settings()).await.unwrap();
        h.session.stop().await;

        let second = h.session.start(settings()).await.unwrap();
        assert_eq!(second.state, SessionState::Listening);
        assert!(second.epoch > first.epoch);
        assert_ne!(second.session_id, first.session_id);
        assert_eq!(second.stats.frames_sent, 0);
        assert_eq!(h.input.opens(), 2);

        h.session.stop().await;
    }

    #[tokio::test]
    async fn test_completions_from_stopped_session_are_ignored() {
        let h = harness(ConnectBehavior::Open);
        h.session.start(settings()).await.unwrap();
        h.transport.emit(TransportEvent::Audio(half_second_packet()));
        assert!(eventually(|| h.output.started_at().len() == 1).await);

        h.session.stop().await;
        h.session.start(settings()).await.unwrap();

        // The old buffer was stopped, so there is nothing left to finish
        assert_eq!(h.output.finish_all(), 0);
        assert_eq!(h.session.state(), SessionState::Listening);

        h.session.stop().await;
    }
}
