//! # Microphone Capture
//!
//! Turns the irregular sample chunks a microphone delivers into fixed-size
//! frames and hands them to the session in capture order.
//!
//! ## How it fits together:
//! - **AudioInput**: the device seam. `open()` acquires the microphone and
//!   starts calling a `SampleSink` from the device's own thread.
//! - **FrameAssembler**: cuts the sample stream into `frame_size` windows.
//! - **CaptureStream**: owns the device handle and a FIFO of finished frames.
//!   The session pulls frames with `next_frame().await` and forwards each one
//!   before asking for the next.
//!
//! ## Backpressure:
//! Frames are never dropped. If the consumer falls behind, frames queue up
//! and `check_backlog()` reports `BackpressureExceeded` once each time the
//! queue grows past `max_backlog` (and again only after it has recovered).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::audio::codec::EncodedPacket;
use crate::error::{VoiceError, VoiceResult};

/// Callback a capture device feeds with raw mono samples.
///
/// ## Rust Concepts:
/// - **Box<dyn FnMut>**: a heap-allocated closure that may mutate its captures
/// - **Send**: the closure is moved onto the device's audio thread
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An acquired input device. Dropping or closing it releases the device.
pub trait InputHandle: Send {
    /// Stop delivering samples and release the device.
    fn close(&mut self);
}

/// Something that can hand out exclusive access to a microphone.
pub trait AudioInput: Send + Sync {
    /// Human-readable device description, for logs.
    fn describe(&self) -> String;

    /// Acquire the device and start delivering mono samples at
    /// `sample_rate` to `sink`.
    ///
    /// Fails with `DeviceUnavailable` when there is no device, permission is
    /// denied, or another session already holds it.
    fn open(&self, sample_rate: u32, sink: SampleSink) -> VoiceResult<Box<dyn InputHandle>>;
}

/// Capture parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Samples per second delivered by the device
    pub sample_rate: u32,

    /// Samples per frame
    pub frame_size: usize,

    /// Queued frames tolerated before a backpressure warning
    pub max_backlog: usize,

    /// Clamp samples to [-1, 1] before they reach the codec
    pub clamp: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,   // What the live service expects on the uplink
            frame_size: 4096,     // ~256ms per frame at 16kHz
            max_backlog: 4,
            clamp: false,
        }
    }
}

/// One fixed-size window of mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Position in capture order, starting at 0
    pub seq: u64,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Encode for the uplink.
    pub fn encode(&self, sample_rate: u32) -> EncodedPacket {
        EncodedPacket::from_samples(&self.samples, sample_rate)
    }
}

/// Accumulates samples and emits complete frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
    next_seq: u64,
    clamp: bool,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, clamp: bool) -> Self {
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
            next_seq: 0,
            clamp,
        }
    }

    /// Append samples, calling `emit` for every frame they complete.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        while !samples.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(samples.len());
            let (head, rest) = samples.split_at(take);
            if self.clamp {
                self.pending.extend(head.iter().map(|s| s.clamp(-1.0, 1.0)));
            } else {
                self.pending.extend_from_slice(head);
            }
            samples = rest;

            if self.pending.len() == self.frame_size {
                let frame = AudioFrame {
                    seq: self.next_seq,
                    samples: std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size)),
                };
                self.next_seq += 1;
                emit(frame);
            }
        }
    }

    /// Samples waiting for the current frame to fill up
    #[cfg(test)]
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// An open microphone producing frames.
pub struct CaptureStream {
    handle: Option<Box<dyn InputHandle>>,
    frames: mpsc::UnboundedReceiver<AudioFrame>,
    /// Frames assembled but not yet taken by `next_frame()`
    queued: Arc<AtomicUsize>,
    config: CaptureConfig,
    over_limit: bool,
    delivered: u64,
}

impl CaptureStream {
    /// Acquire `input` and start assembling frames.
    pub fn open(input: &dyn AudioInput, config: &CaptureConfig) -> VoiceResult<Self> {
        if config.frame_size == 0 {
            return Err(VoiceError::DeviceUnavailable(
                "capture frame size must be greater than 0".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));

        let mut assembler = FrameAssembler::new(config.frame_size, config.clamp);
        let counter = queued.clone();
        let sink: SampleSink = Box::new(move |samples| {
            assembler.push(samples, |frame| {
                // Count first so the consumer can never see the frame before the count
                counter.fetch_add(1, Ordering::SeqCst);
                if tx.send(frame).is_err() {
                    counter.fetch_sub(1, Ordering::SeqCst);
                }
            });
        });

        let handle = input.open(config.sample_rate, sink)?;
        info!(
            "Capture opened on {} ({} Hz, {} samples/frame)",
            input.describe(),
            config.sample_rate,
            config.frame_size
        );

        Ok(Self {
            handle: Some(handle),
            frames: rx,
            queued,
            config: config.clone(),
            over_limit: false,
            delivered: 0,
        })
    }

    /// Wait for the next frame in capture order.
    ///
    /// Returns `None` once the stream is closed or the device stops.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.handle.is_none() {
            return None;
        }
        let frame = self.frames.recv().await?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.delivered += 1;
        Some(frame)
    }

    /// Report a backlog that has grown past the configured bound.
    ///
    /// Returns an error once per episode: after reporting, it stays quiet
    /// until the backlog drops back within the bound.
    pub fn check_backlog(&mut self) -> VoiceResult<()> {
        let backlog = self.backlog();
        if backlog > self.config.max_backlog {
            if !self.over_limit {
                self.over_limit = true;
                return Err(VoiceError::BackpressureExceeded {
                    backlog,
                    limit: self.config.max_backlog,
                });
            }
        } else {
            self.over_limit = false;
        }
        Ok(())
    }

    /// Frames waiting to be taken
    pub fn backlog(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Frames handed out so far
    #[cfg(test)]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Release the microphone. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            self.frames.close();
            debug!("Capture closed after {} frames", self.delivered);
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}
