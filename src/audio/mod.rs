//! # Audio Pipeline
//!
//! Everything between the sound hardware and the wire.
//!
//! ## Key Components:
//! - **codec**: float samples ⇄ 16-bit little-endian PCM ⇄ base64 packets
//! - **capture**: microphone → fixed-size frames, in order, with backlog tracking
//! - **playback**: gapless scheduling of decoded buffers on the output clock
//! - **mixer**: sample-accurate renderer behind the output devices
//! - **dsp**: downmix and rubato resampling for devices with other native
//!   formats (feature `native-audio`)
//! - **native**: cpal microphone and speaker (feature `native-audio`)
//!
//! ## Audio Formats:
//! - **Uplink**: 16kHz, 16-bit PCM, mono, 4096-sample frames
//! - **Downlink**: 24kHz, 16-bit PCM, mono

pub mod capture;    // Microphone framing and backpressure
pub mod codec;      // PCM16 conversion and wire packets
pub mod mixer;      // Sample-clock mixer for output devices
pub mod playback;   // Gapless playback scheduler

#[cfg(feature = "native-audio")]
pub mod dsp;        // Channel/rate conversion
#[cfg(feature = "native-audio")]
pub mod native;     // cpal-backed devices
