//! In-memory stand-ins for the microphone, the speaker and the live service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::audio::capture::{AudioInput, InputHandle, SampleSink};
use crate::audio::codec::EncodedPacket;
use crate::audio::playback::{AudioOutput, BufferId, CompletionHandler};
use crate::error::{VoiceError, VoiceResult};
use crate::transport::{LiveConnection, LiveTransport, SessionSetup, TransportEvent, UplinkMessage};

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// Microphone

#[derive(Default)]
struct ScriptedInputState {
    sink: Option<SampleSink>,
    unavailable: Option<String>,
    opens: usize,
    closes: usize,
}

/// A microphone fed by the test.
#[derive(Clone, Default)]
pub struct ScriptedInput {
    state: Arc<Mutex<ScriptedInputState>>,
}

impl ScriptedInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// A microphone that refuses to open.
    pub fn unavailable(reason: &str) -> Self {
        let input = Self::default();
        input.state.lock().unwrap().unavailable = Some(reason.to_string());
        input
    }

    /// Push samples as if the device captured them. Returns `false` when
    /// nobody has the device open.
    pub fn feed(&self, samples: &[f32]) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.sink.as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

struct ScriptedHandle {
    state: Arc<Mutex<ScriptedInputState>>,
    closed: bool,
}

impl InputHandle for ScriptedHandle {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap();
        state.sink = None;
        state.closes += 1;
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl AudioInput for ScriptedInput {
    fn describe(&self) -> String {
        "scripted input".to_string()
    }

    fn open(&self, _sample_rate: u32, sink: SampleSink) -> VoiceResult<Box<dyn InputHandle>> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.unavailable {
            return Err(VoiceError::DeviceUnavailable(reason.clone()));
        }
        if state.sink.is_some() {
            return Err(VoiceError::DeviceUnavailable("device is in use".to_string()));
        }
        state.sink = Some(sink);
        state.opens += 1;
        Ok(Box::new(ScriptedHandle {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Speaker

#[derive(Default)]
struct ManualClockState {
    now: f64,
    playing: HashMap<BufferId, CompletionHandler>,
    started: Vec<(BufferId, f64)>,
    stopped: Vec<BufferId>,
    refuse_next: bool,
}

/// A speaker whose clock and completions are driven by the test.
pub struct ManualClockOutput {
    sample_rate: u32,
    state: Mutex<ManualClockState>,
}

impl ManualClockOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(ManualClockState::default()),
        }
    }

    pub fn set_time(&self, now: f64) {
        self.state.lock().unwrap().now = now;
    }

    /// Make the next `play_at` fail.
    pub fn refuse_next(&self) {
        self.state.lock().unwrap().refuse_next = true;
    }

    /// `(id, start_time)` of every accepted buffer, in order
    pub fn started_at(&self) -> Vec<(BufferId, f64)> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<BufferId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn playing(&self) -> usize {
        self.state.lock().unwrap().playing.len()
    }

    /// Finish one buffer, firing its completion handler.
    pub fn finish(&self, id: BufferId) -> bool {
        let handler = self.state.lock().unwrap().playing.remove(&id);
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    /// Finish everything still playing, oldest first.
    pub fn finish_all(&self) -> usize {
        let handlers: Vec<CompletionHandler> = {
            let mut state = self.state.lock().unwrap();
            let order: Vec<BufferId> = state.started.iter().map(|(id, _)| *id).collect();
            order
                .into_iter()
                .filter_map(|id| state.playing.remove(&id))
                .collect()
        };
        let count = handlers.len();
        for handler in handlers {
            handler();
        }
        count
    }
}

impl AudioOutput for ManualClockOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn play_at(
        &self,
        id: BufferId,
        _samples: Arc<[f32]>,
        start_time: f64,
        on_complete: CompletionHandler,
    ) -> VoiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.refuse_next) {
            return Err(VoiceError::DeviceUnavailable("speaker refused buffer".to_string()));
        }
        state.playing.insert(id, on_complete);
        state.started.push((id, start_time));
        Ok(())
    }

    fn stop(&self, id: BufferId) {
        let mut state = self.state.lock().unwrap();
        state.playing.remove(&id);
        state.stopped.push(id);
    }
}

// ---------------------------------------------------------------------------
// Live service

/// How `FakeTransport::connect` behaves
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehavior {
    /// Open immediately
    Open,
    /// Fail with a transport error
    Fail(String),
    /// Wait until `release()` is called, then open
    Pending,
}

struct FakeTransportState {
    behavior: ConnectBehavior,
    setups: Vec<SessionSetup>,
    uplink: Vec<EncodedPacket>,
    close_messages: usize,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// A live service that records uplink audio and lets the test inject events.
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
    release: Arc<Notify>,
}

impl FakeTransport {
    pub fn new(behavior: ConnectBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeTransportState {
                behavior,
                setups: Vec::new(),
                uplink: Vec::new(),
                close_messages: 0,
                events: None,
            })),
            release: Arc::new(Notify::new()),
        }
    }

    /// Let a `Pending` connect finish.
    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Send an event down the current connection.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let state = self.state.lock().unwrap();
        state
            .events
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Whether a session currently holds an open connection
    pub fn is_connected(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.events.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().setups.len()
    }

    pub fn last_setup(&self) -> Option<SessionSetup> {
        self.state.lock().unwrap().setups.last().cloned()
    }

    /// Audio packets received so far, in arrival order
    pub fn uplink(&self) -> Vec<EncodedPacket> {
        self.state.lock().unwrap().uplink.clone()
    }

    /// Close requests received on the uplink
    pub fn close_messages(&self) -> usize {
        self.state.lock().unwrap().close_messages
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn connect(&self, setup: SessionSetup) -> VoiceResult<LiveConnection> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.setups.push(setup);
            state.behavior.clone()
        };

        match behavior {
            ConnectBehavior::Fail(reason) => return Err(VoiceError::Transport(reason)),
            ConnectBehavior::Pending => self.release.notified().await,
            ConnectBehavior::Open => {}
        }

        let (up_tx, mut up_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().events = Some(ev_tx);

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(message) = up_rx.recv().await {
                let mut state = state.lock().unwrap();
                match message {
                    UplinkMessage::Audio(packet) => state.uplink.push(packet),
                    UplinkMessage::Close => state.close_messages += 1,
                }
            }
        });

        Ok(LiveConnection::new(up_tx, ev_rx))
    }
}
