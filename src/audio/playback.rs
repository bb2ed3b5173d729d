//! # Gapless Playback Scheduling
//!
//! Downlink audio arrives in bursts at irregular times. The scheduler lines
//! the buffers up back-to-back on the output device's clock so they play
//! without gaps and without overlapping.
//!
//! ## Scheduling policy:
//! ```text
//! start_time      = max(next_start_time, clock.now())
//! next_start_time = start_time + buffer.duration
//! ```
//! A buffer never starts in the past, and never before the previous one
//! ends. If the network delivers faster than real time, latency grows; that
//! is accepted for live voice.
//!
//! ## Thread Safety:
//! The in-flight set is touched by the session driver (schedule, complete)
//! and by `stop()` (clear), so it lives behind a `Mutex`. Completion handlers
//! are fired by the output device from its own thread and must not call
//! back into the scheduler; the session routes them through a channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, trace};

use crate::audio::codec::DecodedAudio;
use crate::error::VoiceResult;

/// Identifies one scheduled buffer on an output device
pub type BufferId = u64;

/// Fired once when a buffer has finished playing.
pub type CompletionHandler = Box<dyn FnOnce() + Send + 'static>;

/// An output device that can start buffers at absolute clock times.
pub trait AudioOutput: Send + Sync {
    /// Rate the device consumes samples at
    fn sample_rate(&self) -> u32;

    /// The device's playback clock, in seconds
    fn current_time(&self) -> f64;

    /// Start `samples` at `start_time` on the playback clock and call
    /// `on_complete` when the last sample has played.
    fn play_at(
        &self,
        id: BufferId,
        samples: Arc<[f32]>,
        start_time: f64,
        on_complete: CompletionHandler,
    ) -> VoiceResult<()>;

    /// Silence a buffer immediately. Its completion handler is dropped
    /// without being called.
    fn stop(&self, id: BufferId);
}

/// Decoded mono audio ready to be scheduled.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn from_decoded(audio: DecodedAudio) -> Self {
        let sample_rate = audio.sample_rate;
        Self::new(audio.into_mono(), sample_rate)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Where a buffer landed on the playback clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_time: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

struct SchedulerInner {
    next_start_time: f64,
    in_flight: HashMap<BufferId, ScheduledBuffer>,
    next_id: BufferId,
}

/// Schedules buffers for gapless, strictly ordered playback.
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    inner: Mutex<SchedulerInner>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let now = output.current_time();
        Self {
            output,
            inner: Mutex::new(SchedulerInner {
                next_start_time: now,
                in_flight: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Queue `buffer` right after everything already scheduled.
    ///
    /// `on_complete` receives the buffer's id when the device finishes
    /// playing it; the caller is expected to report back with
    /// `complete(id)`. Nothing changes if the device refuses the buffer.
    pub fn schedule<F>(&self, buffer: PlaybackBuffer, on_complete: F) -> VoiceResult<ScheduledBuffer>
    where
        F: FnOnce(BufferId) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();

        let start_time = inner.next_start_time.max(self.output.current_time());
        let id = inner.next_id;
        let scheduled = ScheduledBuffer {
            id,
            start_time,
            duration: buffer.duration_secs(),
        };

        self.output.play_at(
            id,
            buffer.samples.clone(),
            start_time,
            Box::new(move || on_complete(id)),
        )?;

        inner.next_id += 1;
        inner.in_flight.insert(id, scheduled);
        inner.next_start_time = scheduled.end_time();

        trace!(
            "Scheduled buffer {} at {:.3}s for {:.3}s ({} in flight)",
            id,
            start_time,
            scheduled.duration,
            inner.in_flight.len()
        );
        Ok(scheduled)
    }

    /// Remove a finished buffer from the in-flight set.
    ///
    /// Returns `true` when this emptied the set, i.e. playback just went
    /// quiet. Unknown ids (already cleared) return `false`.
    pub fn complete(&self, id: BufferId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(&id).is_some() && inner.in_flight.is_empty()
    }

    /// Stop everything in flight and restart the clock at "now".
    ///
    /// Returns how many buffers were cut off.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let stopped = inner.in_flight.len();
        for id in inner.in_flight.keys() {
            self.output.stop(*id);
        }
        inner.in_flight.clear();
        // May move backwards: residual audio that was queued ahead is gone
        inner.next_start_time = self.output.current_time();

        if stopped > 0 {
            debug!("Cleared {} in-flight buffers", stopped);
        }
        stopped
    }

    /// When the next buffer would start, never earlier than the clock.
    pub fn next_start_time(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner.next_start_time.max(self.output.current_time())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }

    /// Whether any buffer is audibly playing or queued
    pub fn is_playing(&self) -> bool {
        self.in_flight() > 0
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output.sample_rate()
    }
}
