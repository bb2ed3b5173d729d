//! # Sample-Clock Mixer
//!
//! Backs the real output devices. Each scheduled buffer becomes a "voice"
//! pinned to an absolute frame on the mixer's clock; `render()` sums the
//! voices that overlap the requested window and advances the clock.
//!
//! ## Clock:
//! The playback clock is `rendered_frames / sample_rate`. It only moves when
//! the device pulls audio, so scheduling stays sample-accurate no matter how
//! late the network delivers.
//!
//! ## Completions:
//! Finished voices have their handlers taken out under the lock and fired
//! after it is released, so a handler is free to do whatever it likes
//! (including scheduling more audio).

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::audio::playback::{AudioOutput, BufferId, CompletionHandler};
use crate::error::VoiceResult;

struct Voice {
    id: BufferId,
    samples: Arc<[f32]>,
    start_frame: u64,
    on_complete: Option<CompletionHandler>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct MixerInner {
    rendered_frames: u64,
    voices: Vec<Voice>,
}

/// Mixes scheduled buffers onto a single mono timeline.
pub struct Mixer {
    sample_rate: u32,
    inner: Mutex<MixerInner>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            inner: Mutex::new(MixerInner {
                rendered_frames: 0,
                voices: Vec::new(),
            }),
        }
    }

    /// Fill `out` (mono) with the next `out.len()` frames of the timeline.
    pub fn render(&self, out: &mut [f32]) {
        let finished = {
            let mut inner = self.inner.lock().unwrap();
            let window_start = inner.rendered_frames;
            let window_end = window_start + out.len() as u64;

            out.fill(0.0);
            for voice in &inner.voices {
                let from = voice.start_frame.max(window_start);
                let to = voice.end_frame().min(window_end);
                for frame in from..to {
                    let sample = voice.samples[(frame - voice.start_frame) as usize];
                    out[(frame - window_start) as usize] += sample;
                }
            }
            for sample in out.iter_mut() {
                *sample = sample.clamp(-1.0, 1.0);
            }

            inner.rendered_frames = window_end;

            let mut finished = Vec::new();
            inner.voices.retain_mut(|voice| {
                if voice.end_frame() <= window_end {
                    finished.push((voice.id, voice.on_complete.take()));
                    false
                } else {
                    true
                }
            });
            finished
        };

        for (id, handler) in finished {
            trace!("Voice {} finished", id);
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    /// Render into an interleaved buffer, copying the mono mix to every channel.
    #[cfg(feature = "native-audio")]
    pub fn render_interleaved(&self, out: &mut [f32], channels: usize, scratch: &mut Vec<f32>) {
        let channels = channels.max(1);
        scratch.resize(out.len() / channels, 0.0);
        self.render(scratch);
        for (frame, &sample) in out.chunks_mut(channels).zip(scratch.iter()) {
            frame.fill(sample);
        }
    }

    /// Voices still scheduled or playing
    #[cfg(test)]
    pub fn active_voices(&self) -> usize {
        self.inner.lock().unwrap().voices.len()
    }
}

impl AudioOutput for Mixer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner.rendered_frames as f64 / self.sample_rate as f64
    }

    fn play_at(
        &self,
        id: BufferId,
        samples: Arc<[f32]>,
        start_time: f64,
        on_complete: CompletionHandler,
    ) -> VoiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let requested = (start_time * self.sample_rate as f64).round().max(0.0) as u64;
        // Anything in the past starts at the next rendered frame
        let start_frame = requested.max(inner.rendered_frames);
        inner.voices.push(Voice {
            id,
            samples,
            start_frame,
            on_complete: Some(on_complete),
        });
        Ok(())
    }

    fn stop(&self, id: BufferId) {
        let mut inner = self.inner.lock().unwrap();
        inner.voices.retain(|voice| voice.id != id);
    }
}
