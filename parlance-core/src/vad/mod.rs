//! Voice activity analysis.
//!
//! The [`VadAnalyzer`] trait is the extensibility point: the input transport
//! feeds it raw PCM16 and reduces the returned [`VadState`] into committed
//! quiet/speaking transitions. Analysis is synchronous and CPU-bound; the
//! transport runs it on a blocking worker so the pipeline context never
//! stalls.
//!
//! `EnergyVadAnalyzer` is the built-in implementation: smoothed RMS volume
//! against a threshold, with the starting/stopping phases driven by how much
//! audio has been observed in the transitional state.

use crate::audio::{calculate_volume, exp_smoothing};
use crate::error::{ParlanceError, Result};

/// Voice activity state reported by an analyzer.
///
/// `Starting` and `Stopping` are internal to the analyzer; consumers commit
/// only `Quiet` and `Speaking` transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Quiet,
    Starting,
    Speaking,
    Stopping,
}

/// Tuning knobs for voice activity analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadParams {
    /// Seconds of continuous speech before `Speaking` is entered.
    pub start_secs: f32,
    /// Seconds of continuous silence before `Quiet` is entered.
    pub stop_secs: f32,
    /// Normalized RMS volume above which a chunk counts as speech.
    pub min_volume: f32,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            start_secs: 0.2,
            stop_secs: 0.8,
            min_volume: 0.02,
        }
    }
}

/// Contract for voice activity analyzers.
///
/// Implementors may be stateful (smoothing, hidden states). Calls are
/// serialized by the owning transport.
pub trait VadAnalyzer: Send {
    fn set_sample_rate(&mut self, sample_rate: u32);

    fn set_params(&mut self, params: VadParams);

    /// Analyze one PCM16 chunk and report the current state.
    fn analyze_audio(&mut self, audio: &[u8]) -> Result<VadState>;
}

/// Exponential smoothing factor for the volume envelope.
const VOLUME_SMOOTHING_FACTOR: f32 = 0.5;

/// Energy-based voice activity analyzer.
pub struct EnergyVadAnalyzer {
    params: VadParams,
    sample_rate: u32,
    smoothed_volume: f32,
    state: VadState,
    /// Audio observed while in the current transitional state, in seconds.
    transition_secs: f32,
}

impl EnergyVadAnalyzer {
    pub fn new(params: VadParams) -> Self {
        Self {
            params,
            sample_rate: 16_000,
            smoothed_volume: 0.0,
            state: VadState::Quiet,
            transition_secs: 0.0,
        }
    }

    fn is_speech(&mut self, audio: &[u8]) -> bool {
        let volume = calculate_volume(audio);
        self.smoothed_volume =
            exp_smoothing(volume, self.smoothed_volume, VOLUME_SMOOTHING_FACTOR);
        self.smoothed_volume >= self.params.min_volume
    }
}

impl Default for EnergyVadAnalyzer {
    fn default() -> Self {
        Self::new(VadParams::default())
    }
}

impl VadAnalyzer for EnergyVadAnalyzer {
    fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    fn set_params(&mut self, params: VadParams) {
        self.params = params;
    }

    fn analyze_audio(&mut self, audio: &[u8]) -> Result<VadState> {
        if audio.len() % 2 != 0 {
            return Err(ParlanceError::Analyzer(format!(
                "pcm16 payload has odd length {}",
                audio.len()
            )));
        }
        if self.sample_rate == 0 {
            return Err(ParlanceError::Analyzer("sample rate not set".into()));
        }

        let chunk_secs = (audio.len() / 2) as f32 / self.sample_rate as f32;
        let speech = self.is_speech(audio);

        self.state = match self.state {
            VadState::Quiet if speech => {
                self.transition_secs = chunk_secs;
                if self.transition_secs >= self.params.start_secs {
                    VadState::Speaking
                } else {
                    VadState::Starting
                }
            }
            VadState::Quiet => VadState::Quiet,
            VadState::Starting if speech => {
                self.transition_secs += chunk_secs;
                if self.transition_secs >= self.params.start_secs {
                    VadState::Speaking
                } else {
                    VadState::Starting
                }
            }
            VadState::Starting => VadState::Quiet,
            VadState::Speaking if speech => VadState::Speaking,
            VadState::Speaking => {
                self.transition_secs = chunk_secs;
                if self.transition_secs >= self.params.stop_secs {
                    VadState::Quiet
                } else {
                    VadState::Stopping
                }
            }
            VadState::Stopping if speech => VadState::Speaking,
            VadState::Stopping => {
                self.transition_secs += chunk_secs;
                if self.transition_secs >= self.params.stop_secs {
                    VadState::Quiet
                } else {
                    VadState::Stopping
                }
            }
        };

        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::f32_to_pcm_s16le;

    fn loud_chunk(samples: usize) -> Vec<u8> {
        let wave: Vec<f32> = (0..samples)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        f32_to_pcm_s16le(&wave)
    }

    fn silent_chunk(samples: usize) -> Vec<u8> {
        f32_to_pcm_s16le(&vec![0.0f32; samples])
    }

    fn analyzer() -> EnergyVadAnalyzer {
        // 0.1 s chunks at 16 kHz: speaking after two loud chunks, quiet
        // after two silent ones.
        let mut vad = EnergyVadAnalyzer::new(VadParams {
            start_secs: 0.2,
            stop_secs: 0.2,
            min_volume: 0.2,
        });
        vad.set_sample_rate(16_000);
        vad
    }

    #[test]
    fn silence_stays_quiet() {
        let mut vad = analyzer();
        for _ in 0..5 {
            assert_eq!(vad.analyze_audio(&silent_chunk(1600)).unwrap(), VadState::Quiet);
        }
    }

    #[test]
    fn speech_ramps_through_starting_to_speaking() {
        let mut vad = analyzer();
        assert_eq!(vad.analyze_audio(&loud_chunk(1600)).unwrap(), VadState::Starting);
        assert_eq!(vad.analyze_audio(&loud_chunk(1600)).unwrap(), VadState::Speaking);
        assert_eq!(vad.analyze_audio(&loud_chunk(1600)).unwrap(), VadState::Speaking);
    }

    #[test]
    fn short_burst_falls_back_to_quiet() {
        let mut vad = analyzer();
        assert_eq!(vad.analyze_audio(&loud_chunk(1600)).unwrap(), VadState::Starting);
        assert_eq!(vad.analyze_audio(&silent_chunk(1600)).unwrap(), VadState::Quiet);
    }

    #[test]
    fn silence_ramps_through_stopping_to_quiet() {
        let mut vad = analyzer();
        vad.analyze_audio(&loud_chunk(1600)).unwrap();
        vad.analyze_audio(&loud_chunk(1600)).unwrap();
        assert_eq!(vad.analyze_audio(&silent_chunk(1600)).unwrap(), VadState::Stopping);
        assert_eq!(vad.analyze_audio(&silent_chunk(1600)).unwrap(), VadState::Quiet);
    }

    #[test]
    fn speech_during_stopping_resumes_speaking() {
        let mut vad = analyzer();
        vad.analyze_audio(&loud_chunk(1600)).unwrap();
        vad.analyze_audio(&loud_chunk(1600)).unwrap();
        assert_eq!(vad.analyze_audio(&silent_chunk(1600)).unwrap(), VadState::Stopping);
        assert_eq!(vad.analyze_audio(&loud_chunk(1600)).unwrap(), VadState::Speaking);
    }

    #[test]
    fn odd_length_payload_is_an_error() {
        let mut vad = analyzer();
        assert!(vad.analyze_audio(&[0u8; 3]).is_err());
    }

    #[test]
    fn updated_params_take_effect() {
        let mut vad = analyzer();
        vad.set_params(VadParams {
            start_secs: 0.05,
            stop_secs: 0.2,
            min_volume: 0.2,
        });
        // One 0.1 s chunk now satisfies start_secs directly.
        assert_eq!(vad.analyze_audio(&loud_chunk(1600)).unwrap(), VadState::Speaking);
    }
}
