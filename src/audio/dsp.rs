//! Channel and rate conversion for devices that can't run at the rates the
//! live service uses (16 kHz mono in, 24 kHz mono out).

use rubato::{FftFixedIn, Resampler};

use crate::error::{VoiceError, VoiceResult};

/// Input frames handed to the FFT resampler per call
pub const RESAMPLE_CHUNK: usize = 1024;

/// Average interleaved frames down to mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Mono stream resampler on top of `rubato::FftFixedIn`.
///
/// Device callbacks deliver whatever block size the host picks, while the
/// FFT resampler wants exactly `input_frames_next()` samples per call. Input
/// is accumulated and only whole chunks are resampled; the remainder waits
/// for the next call. No zero padding is inserted.
pub struct StreamResampler {
    /// `None` when both rates match
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> VoiceResult<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            let resampler =
                FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 1, 1)
                    .map_err(|e| {
                        VoiceError::DeviceUnavailable(format!(
                            "cannot resample {} Hz to {} Hz: {}",
                            from_rate, to_rate, e
                        ))
                    })?;
            Some(resampler)
        };

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLE_CHUNK * 2),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Samples fed in that haven't made up a whole chunk yet
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed samples at the source rate, get back whatever is ready at the
    /// target rate.
    pub fn process(&mut self, input: &[f32]) -> VoiceResult<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(input.to_vec());
        };

        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = resampler
                .process(&[chunk], None)
                .map_err(|e| VoiceError::DeviceUnavailable(format!("resampling failed: {}", e)))?;
            if let Some(channel) = resampled.into_iter().next() {
                output.extend(channel);
            }
        }
        Ok(output)
    }
}
