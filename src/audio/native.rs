//! # Native Audio Devices (cpal)
//!
//! Real microphone and speaker implementations of the device seams.
//!
//! ## Threading:
//! `cpal::Stream` is not `Send`, so every stream is built, played and
//! dropped on a dedicated OS thread. The handle kept by the rest of the
//! program only holds a stop channel and the thread's `JoinHandle`; closing
//! it drops the stream and joins the thread.
//!
//! ## Format negotiation:
//! Devices are asked for f32 samples at the wanted rate and channel count.
//! When they can't do that, the nearest supported config is used and the
//! stream is downmixed/resampled in the audio callback.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig, SupportedStreamConfig};
use tracing::{debug, error, info, warn};

use crate::audio::capture::{AudioInput, InputHandle, SampleSink};
use crate::audio::dsp::{downmix, StreamResampler, RESAMPLE_CHUNK};
use crate::audio::mixer::Mixer;
use crate::audio::playback::{AudioOutput, BufferId, CompletionHandler};
use crate::device::DeviceSelector;
use crate::error::{VoiceError, VoiceResult};

/// Find a device by selector, the way the host lists them.
fn find_device(selector: &DeviceSelector, input: bool) -> VoiceResult<Device> {
    let host = cpal::default_host();
    match selector {
        DeviceSelector::Default => {
            let device = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            device.ok_or_else(|| {
                VoiceError::DeviceUnavailable(format!(
                    "no default {} device",
                    if input { "input" } else { "output" }
                ))
            })
        }
        DeviceSelector::Named(_) => {
            let devices: Vec<Device> = if input {
                host.input_devices()?.collect()
            } else {
                host.output_devices()?.collect()
            };
            devices
                .into_iter()
                .find(|device| device.name().map(|n| selector.matches(&n)).unwrap_or(false))
                .ok_or_else(|| VoiceError::DeviceUnavailable(format!("device '{}' not found", selector)))
        }
    }
}

/// Pick an f32 config, preferring mono at `sample_rate`.
fn choose_config(
    configs: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Option<SupportedStreamConfig> {
    let target = SampleRate(sample_rate);
    let mut fallback = None;
    for range in configs.filter(|c| c.sample_format() == SampleFormat::F32) {
        debug!(
            "Supported config: channels={}, sample_rate={:?}-{:?}",
            range.channels(),
            range.min_sample_rate(),
            range.max_sample_rate()
        );
        let rate_ok = range.min_sample_rate() <= target && target <= range.max_sample_rate();
        if rate_ok && range.channels() == 1 {
            return Some(range.with_sample_rate(target));
        }
        if rate_ok {
            fallback = Some(range.with_sample_rate(target));
        } else if fallback.is_none() {
            fallback = Some(range.with_max_sample_rate());
        }
    }
    fallback
}

/// Owns a stream thread; closing stops the stream and joins.
struct StreamThread {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Run `build` on a new thread and keep the stream alive until closed.
    ///
    /// Returns once the stream is playing, or with the error that stopped it.
    fn spawn<F>(name: &str, build: F) -> VoiceResult<Self>
    where
        F: FnOnce() -> VoiceResult<cpal::Stream> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|s| {
                    s.play()?;
                    Ok(s)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns when the handle sends or is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| VoiceError::DeviceUnavailable(format!("could not spawn audio thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::DeviceUnavailable("audio thread exited during setup".to_string()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.close();
    }
}

/// Microphone through cpal.
pub struct CpalInput {
    selector: DeviceSelector,
}

impl CpalInput {
    pub fn new(selector: DeviceSelector) -> Self {
        Self { selector }
    }
}

struct CpalInputHandle {
    stream: StreamThread,
}

impl InputHandle for CpalInputHandle {
    fn close(&mut self) {
        self.stream.close();
    }
}

impl AudioInput for CpalInput {
    fn describe(&self) -> String {
        format!("cpal input '{}'", self.selector)
    }

    fn open(&self, sample_rate: u32, mut sink: SampleSink) -> VoiceResult<Box<dyn InputHandle>> {
        let selector = self.selector.clone();
        let stream = StreamThread::spawn("capture", move || {
            let device = find_device(&selector, true)?;
            let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

            let supported = choose_config(device.supported_input_configs()?, sample_rate)
                .ok_or_else(|| VoiceError::DeviceUnavailable("no f32 input configuration".to_string()))?;
            let config: StreamConfig = supported.config();
            let channels = config.channels as usize;
            info!(
                "Using audio input device: {} ({} ch @ {} Hz, target {} Hz)",
                device_name, channels, config.sample_rate.0, sample_rate
            );

            let mut resampler = StreamResampler::new(config.sample_rate.0, sample_rate)?;
            let stream = device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    match resampler.process(&mono) {
                        Ok(samples) if !samples.is_empty() => sink(&samples),
                        Ok(_) => {}
                        Err(e) => error!("Dropping captured audio: {}", e),
                    }
                },
                move |err| error!("Audio input stream error: {}", err),
                None,
            )?;
            Ok(stream)
        })?;

        Ok(Box::new(CpalInputHandle { stream }))
    }
}

/// Speaker through cpal, fed by a sample-clock `Mixer`.
pub struct CpalOutput {
    mixer: Arc<Mixer>,
    _stream: StreamThread,
}

impl CpalOutput {
    /// Open the speaker and start rendering silence until buffers arrive.
    pub fn open(selector: DeviceSelector, sample_rate: u32) -> VoiceResult<Self> {
        let mixer = Arc::new(Mixer::new(sample_rate));
        let render_mixer = mixer.clone();

        let stream = StreamThread::spawn("playback", move || {
            let device = find_device(&selector, false)?;
            let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

            let supported = choose_config(device.supported_output_configs()?, sample_rate)
                .ok_or_else(|| VoiceError::DeviceUnavailable("no f32 output configuration".to_string()))?;
            let config: StreamConfig = supported.config();
            let channels = config.channels as usize;
            let device_rate = config.sample_rate.0;
            info!(
                "Using audio output device: {} ({} ch @ {} Hz, mixer {} Hz)",
                device_name, channels, device_rate, sample_rate
            );
            if device_rate != sample_rate {
                warn!("Output device can't run at {} Hz, resampling", sample_rate);
            }

            let mut resampler = StreamResampler::new(sample_rate, device_rate)?;
            let mut scratch = Vec::new();
            let mut pending: std::collections::VecDeque<f32> = std::collections::VecDeque::new();
            let mut chunk = vec![0.0f32; RESAMPLE_CHUNK];

            let stream = device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if resampler.is_passthrough() {
                        render_mixer.render_interleaved(data, channels, &mut scratch);
                        return;
                    }
                    let frames = data.len() / channels.max(1);
                    while pending.len() < frames {
                        render_mixer.render(&mut chunk);
                        match resampler.process(&chunk) {
                            Ok(samples) => pending.extend(samples),
                            Err(e) => {
                                error!("Output resampling failed: {}", e);
                                break;
                            }
                        }
                    }
                    for frame in data.chunks_mut(channels.max(1)) {
                        frame.fill(pending.pop_front().unwrap_or(0.0));
                    }
                },
                move |err| error!("Audio output stream error: {}", err),
                None,
            )?;
            Ok(stream)
        })?;

        Ok(Self {
            mixer,
            _stream: stream,
        })
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn play_at(
        &self,
        id: BufferId,
        samples: Arc<[f32]>,
        start_time: f64,
        on_complete: CompletionHandler,
    ) -> VoiceResult<()> {
        self.mixer.play_at(id, samples, start_time, on_complete)
    }

    fn stop(&self, id: BufferId) {
        self.mixer.stop(id)
    }
}
