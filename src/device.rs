//! # Audio Device Selection and Management
//!
//! Picks the microphone and speaker a session runs on, with a fallback for
//! builds (and hosts) that have no sound hardware.
//!
//! ## Backends:
//! - **native-audio** feature: real devices through `cpal` (see `audio::native`)
//! - **Detached**: no microphone (opening it fails with `DeviceUnavailable`),
//!   and a speaker that renders into the void on a wall-clock timer so
//!   playback timing and completions still behave like real hardware

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::audio::capture::{AudioInput, InputHandle, SampleSink};
use crate::audio::mixer::Mixer;
use crate::audio::playback::{AudioOutput, BufferId, CompletionHandler};
use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};

/// Which device to use, as written in configuration
#[cfg(feature = "native-audio")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// The host's default device
    Default,
    /// First device whose name contains this text
    Named(String),
}

#[cfg(feature = "native-audio")]
impl std::str::FromStr for DeviceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" => Err("Device name cannot be empty".to_string()),
            "default" | "auto" => Ok(DeviceSelector::Default),
            _ => Ok(DeviceSelector::Named(trimmed.to_string())),
        }
    }
}

#[cfg(feature = "native-audio")]
impl Default for DeviceSelector {
    fn default() -> Self {
        DeviceSelector::Default
    }
}

#[cfg(feature = "native-audio")]
impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Default => write!(f, "default"),
            DeviceSelector::Named(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(feature = "native-audio")]
impl DeviceSelector {
    /// Parse a configured name, falling back to the default device
    pub fn from_config(value: &str) -> Self {
        value.parse().unwrap_or_else(|err| {
            warn!("Invalid device selector '{}' ({}), using default", value, err);
            DeviceSelector::Default
        })
    }

    /// Whether a device called `name` satisfies this selector
    pub fn matches(&self, name: &str) -> bool {
        match self {
            DeviceSelector::Default => true,
            DeviceSelector::Named(wanted) => name.contains(wanted.as_str()),
        }
    }
}

/// The microphone and speaker a voice session runs on.
///
/// The speaker is long-lived: it is opened once at startup and shared by
/// every session. The microphone is only acquired while a session runs.
#[derive(Clone)]
pub struct AudioDevices {
    pub input: Arc<dyn AudioInput>,
    pub output: Arc<dyn AudioOutput>,
}

impl AudioDevices {
    /// Open the devices named in configuration.
    #[cfg(feature = "native-audio")]
    pub fn from_config(config: &AudioConfig) -> VoiceResult<Self> {
        use crate::audio::native::{CpalInput, CpalOutput};

        let input = CpalInput::new(DeviceSelector::from_config(&config.input_device));
        let output = match CpalOutput::open(
            DeviceSelector::from_config(&config.output_device),
            config.playback_sample_rate,
        ) {
            Ok(output) => Arc::new(output) as Arc<dyn AudioOutput>,
            Err(e) => {
                warn!("Speaker unavailable ({}), playing into a detached output", e);
                Arc::new(DetachedOutput::new(config.playback_sample_rate))
            }
        };

        Ok(Self {
            input: Arc::new(input),
            output,
        })
    }

    /// Without native audio there is nothing to open.
    #[cfg(not(feature = "native-audio"))]
    pub fn from_config(config: &AudioConfig) -> VoiceResult<Self> {
        info!("Built without native-audio; using detached audio devices");
        Ok(Self::detached(config.playback_sample_rate))
    }

    pub fn detached(playback_sample_rate: u32) -> Self {
        Self {
            input: Arc::new(DetachedInput),
            output: Arc::new(DetachedOutput::new(playback_sample_rate)),
        }
    }
}

/// A microphone that is never there.
pub struct DetachedInput;

impl AudioInput for DetachedInput {
    fn describe(&self) -> String {
        "detached input".to_string()
    }

    fn open(&self, _sample_rate: u32, _sink: SampleSink) -> VoiceResult<Box<dyn InputHandle>> {
        Err(VoiceError::DeviceUnavailable(
            "no capture device (build with the native-audio feature)".to_string(),
        ))
    }
}

/// Tick length of the detached render loop
const DETACHED_TICK: Duration = Duration::from_millis(20);

/// A speaker with no hardware behind it.
///
/// A background thread pulls from a `Mixer` in real time and throws the
/// samples away, so the playback clock advances and buffers complete when
/// they would have finished playing.
pub struct DetachedOutput {
    mixer: Arc<Mixer>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DetachedOutput {
    pub fn new(sample_rate: u32) -> Self {
        let mixer = Arc::new(Mixer::new(sample_rate));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let mixer = mixer.clone();
            let running = running.clone();
            let frames_per_tick =
                (sample_rate as u64 * DETACHED_TICK.as_millis() as u64 / 1000).max(1) as usize;
            std::thread::Builder::new()
                .name("detached-output".to_string())
                .spawn(move || {
                    let mut scratch = vec![0.0f32; frames_per_tick];
                    while running.load(Ordering::Relaxed) {
                        std::thread::sleep(DETACHED_TICK);
                        mixer.render(&mut scratch);
                    }
                    debug!("Detached output stopped");
                })
                .map_err(|e| warn!("Could not start detached output thread: {}", e))
                .ok()
        };

        Self {
            mixer,
            running,
            thread,
        }
    }
}

impl AudioOutput for DetachedOutput {
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

impl Drop for DetachedOutput {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
