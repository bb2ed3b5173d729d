//! # PCM Codec
//!
//! Converts between floating-point samples and the 16-bit little-endian PCM
//! the live service speaks, and wraps PCM bytes into the base64 packets that
//! travel over the wire.
//!
//! ## Conversion rules:
//! - **Encode**: each sample `s` becomes `round(s * 32768)` as a signed 16-bit
//!   integer. Nothing is clamped: `1.0` and anything outside [-1, 1) wraps
//!   around the 16-bit range. Callers that want clamping do it before encoding
//!   (see `CaptureConfig::clamp`).
//! - **Decode**: each little-endian `i16` becomes `i / 32768.0`, deinterleaved
//!   across the requested channel count.

use base64::{engine::general_purpose::STANDARD, Engine};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{VoiceError, VoiceResult};

/// Full-scale value for 16-bit PCM
pub const PCM_SCALE: f64 = 32768.0;

/// Bytes per 16-bit sample
pub const BYTES_PER_SAMPLE: usize = 2;

const PCM_MIME: &str = "audio/pcm";

/// Stateless PCM16 encoder/decoder.
pub struct AudioFrameCodec;

impl AudioFrameCodec {
    /// Encode float samples as little-endian PCM16 bytes, in order.
    pub fn encode(samples: &[f32]) -> Vec<u8> {
        let quantized: Vec<i16> = samples.iter().map(|&s| Self::quantize(s)).collect();
        let mut bytes = vec![0u8; quantized.len() * BYTES_PER_SAMPLE];
        LittleEndian::write_i16_into(&quantized, &mut bytes);
        bytes
    }

    /// Decode little-endian PCM16 bytes into per-channel float buffers.
    ///
    /// Fails with `MalformedAudioData` unless the byte length is a whole
    /// number of `2 * channels` byte frames.
    pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> VoiceResult<DecodedAudio> {
        let frame_bytes = BYTES_PER_SAMPLE * channels as usize;
        if frame_bytes == 0 || bytes.len() % frame_bytes != 0 {
            return Err(VoiceError::MalformedAudioData {
                len: bytes.len(),
                frame_bytes,
            });
        }

        let mut interleaved = vec![0i16; bytes.len() / BYTES_PER_SAMPLE];
        LittleEndian::read_i16_into(bytes, &mut interleaved);

        let channel_count = channels as usize;
        let frames = interleaved.len() / channel_count;
        let mut data = vec![Vec::with_capacity(frames); channel_count];
        for frame in interleaved.chunks_exact(channel_count) {
            for (channel, &sample) in frame.iter().enumerate() {
                data[channel].push(sample as f32 / PCM_SCALE as f32);
            }
        }

        Ok(DecodedAudio {
            sample_rate,
            channels: data,
        })
    }

    /// `round(s * 32768)` truncated to 16 bits.
    ///
    /// The `i64` step saturates (and maps NaN to 0); the `i16` step keeps the
    /// low 16 bits, which is where out-of-range input wraps.
    fn quantize(sample: f32) -> i16 {
        ((sample as f64 * PCM_SCALE).round() as i64) as i16
    }
}

/// Decoded multi-channel audio.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    /// One buffer per channel, all the same length
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Collapse to a single channel by averaging.
    pub fn into_mono(mut self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels.swap_remove(0),
            count => (0..self.frames())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / count as f32)
                .collect(),
        }
    }
}

/// PCM bytes in transit: a MIME descriptor plus base64 text.
///
/// The field names match the service's inline-data blobs, so a packet
/// serializes straight into the uplink message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedPacket {
    pub mime_type: String,
    pub data: String,
}

impl EncodedPacket {
    /// Encode float samples captured at `sample_rate`.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self::from_pcm_bytes(&AudioFrameCodec::encode(samples), sample_rate)
    }

    pub fn from_pcm_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        Self {
            mime_type: pcm_mime(sample_rate),
            data: STANDARD.encode(bytes),
        }
    }

    /// The raw PCM bytes carried by this packet.
    pub fn pcm_bytes(&self) -> VoiceResult<Vec<u8>> {
        Ok(STANDARD.decode(self.data.as_bytes())?)
    }

    /// Whether the descriptor names raw PCM audio.
    pub fn is_pcm(&self) -> bool {
        self.mime_type
            .split(';')
            .next()
            .map(|base| base.trim().eq_ignore_ascii_case(PCM_MIME))
            .unwrap_or(false)
    }

    /// The `rate=` parameter of the descriptor, if present and numeric.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type.split(';').skip(1).find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("rate") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
    }

    /// Decode into per-channel samples, using `fallback_rate` when the
    /// descriptor carries no rate.
    pub fn decode(&self, fallback_rate: u32, channels: u16) -> VoiceResult<DecodedAudio> {
        let bytes = self.pcm_bytes()?;
        AudioFrameCodec::decode(&bytes, self.sample_rate().unwrap_or(fallback_rate), channels)
    }
}

/// `audio/pcm;rate=<rate>`
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME, sample_rate)
}
