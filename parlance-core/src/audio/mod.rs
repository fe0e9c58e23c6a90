//! Audio byte utilities and sample-rate conversion.
//!
//! All pipeline audio is interleaved signed 16-bit little-endian PCM. The
//! output stage writes at one negotiated rate while upstream services may
//! produce another; [`AudioResampler`] bridges that gap per media sender.
//!
//! Unlike a streaming converter, [`resample`](AudioResampler::resample) is a
//! stateless whole-buffer transform: equal rates short-circuit to identity,
//! anything else runs rubato's very-high-quality sinc polyphase tier (long
//! sinc, cubic interpolation) and returns the rate-converted signal with the
//! filter delay trimmed.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{ParlanceError, Result};

/// Stateless mono PCM16 sample-rate conversion.
pub trait AudioResampler: Send + Sync {
    /// Convert `audio` (s16le mono) from `in_rate` to `out_rate`.
    ///
    /// Equal rates return the input unchanged. Odd-length input is rejected
    /// as a malformed frame.
    fn resample(&self, audio: &[u8], in_rate: u32, out_rate: u32) -> Result<Vec<u8>>;
}

/// Sinc polyphase resampler built on rubato.
///
/// A converter session is created per call, sized to the whole input buffer,
/// then flushed so the tail of the signal is not left in the filter.
#[derive(Debug, Default)]
pub struct RubatoResampler;

/// Upper bound on flush iterations when draining the filter tail.
const MAX_FLUSH_PASSES: usize = 16;

impl AudioResampler for RubatoResampler {
    fn resample(&self, audio: &[u8], in_rate: u32, out_rate: u32) -> Result<Vec<u8>> {
        if in_rate == out_rate {
            return Ok(audio.to_vec());
        }
        if audio.len() % 2 != 0 {
            return Err(ParlanceError::MalformedFrame(format!(
                "pcm16 payload has odd length {}",
                audio.len()
            )));
        }

        let samples = pcm_s16le_to_f32(audio);
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let ratio = out_rate as f64 / in_rate as f64;
        // Very-high-quality tier: long sinc with cubic interpolation.
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            oversampling_factor: 256,
            interpolation: SincInterpolationType::Cubic,
            window: WindowFunction::BlackmanHarris2,
        };

        let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)
            .map_err(|e| ParlanceError::Resample(format!("init: {e}")))?;

        let delay = resampler.output_delay();
        let expected = (samples.len() as f64 * ratio).round() as usize;

        let mut collected: Vec<f32> = Vec::with_capacity(delay + expected);
        let out = resampler
            .process(&[&samples[..]], None)
            .map_err(|e| ParlanceError::Resample(format!("process: {e}")))?;
        collected.extend_from_slice(&out[0]);

        // Drain the filter tail until the delayed end of the signal is out.
        let mut passes = 0;
        while collected.len() < delay + expected && passes < MAX_FLUSH_PASSES {
            let out = resampler
                .process_partial::<&[f32]>(None, None)
                .map_err(|e| ParlanceError::Resample(format!("flush: {e}")))?;
            if out[0].is_empty() {
                break;
            }
            collected.extend_from_slice(&out[0]);
            passes += 1;
        }

        let start = delay.min(collected.len());
        let end = (delay + expected).min(collected.len());
        Ok(f32_to_pcm_s16le(&collected[start..end]))
    }
}

/// Build the resampler used by media senders.
pub fn create_default_resampler() -> Box<dyn AudioResampler> {
    Box::new(RubatoResampler)
}

/// Decode s16le bytes into normalized f32 samples in [-1.0, 1.0].
pub fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
        .collect()
}

/// Encode normalized f32 samples as s16le bytes, clamping out-of-range input.
pub fn f32_to_pcm_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Normalized RMS level of an s16le buffer, in [0.0, 1.0].
pub fn calculate_volume(audio: &[u8]) -> f32 {
    let samples = pcm_s16le_to_f32(audio);
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt().clamp(0.0, 1.0)
}

/// One step of exponential smoothing toward `value`.
pub fn exp_smoothing(value: f32, prev_value: f32, factor: f32) -> f32 {
    prev_value + factor * (value - prev_value)
}
