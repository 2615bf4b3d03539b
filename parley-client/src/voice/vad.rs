//! Voice activity detection
//!
//! Two interchangeable strategies decide whether a capture period is worth
//! sending: a plain peak gate, and RNNoise's speech probability. RNNoise can
//! also replace the period with its denoised output.

use nnnoiseless::DenoiseState;
use parley_common::audio::VOICE_CHANNELS;
use serde::{Deserialize, Serialize};

/// RNNoise works on 10ms mono frames at 48kHz
pub const RNNOISE_FRAME_SIZE: usize = DenoiseState::FRAME_SIZE;

/// RNNoise expects samples in 16-bit integer range
const I16_SCALE: f32 = 32767.0;

// =============================================================================
// VAD Method
// =============================================================================

/// Strategy used to gate transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VadMethod {
    /// Transmit when the period's peak exceeds the threshold
    #[default]
    PeakGate,
    /// Transmit when RNNoise's speech probability exceeds the threshold
    Rnnoise,
}

impl VadMethod {
    /// Compact form for storing in an atomic
    pub fn as_u8(self) -> u8 {
        match self {
            VadMethod::PeakGate => 0,
            VadMethod::Rnnoise => 1,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => VadMethod::Rnnoise,
            _ => VadMethod::PeakGate,
        }
    }
}

/// Peak gate decision
pub fn peak_gate(peak: f32, threshold: f32) -> bool {
    peak > threshold
}

// =============================================================================
// RNNoise
// =============================================================================

/// Per-channel RNNoise denoisers
///
/// All buffers are allocated up front so `process` is safe to call from the
/// capture callback.
pub struct RnnoiseVad {
    states: Vec<Box<DenoiseState<'static>>>,
    input: [f32; RNNOISE_FRAME_SIZE],
    output: [f32; RNNOISE_FRAME_SIZE],
}

impl RnnoiseVad {
    /// Create one denoiser per engine channel
    pub fn new() -> Self {
        Self {
            states: (0..VOICE_CHANNELS).map(|_| DenoiseState::new()).collect(),
            input: [0.0; RNNOISE_FRAME_SIZE],
            output: [0.0; RNNOISE_FRAME_SIZE],
        }
    }

    /// Run one interleaved period through the denoisers
    ///
    /// # Arguments
    /// * `pcm` - Exactly `RNNOISE_FRAME_SIZE` samples per channel
    /// * `suppress` - Overwrite `pcm` with the denoised signal
    ///
    /// # Returns
    /// The highest speech probability across channels (0.0 to 1.0). A period
    /// of the wrong length is left untouched and scores 0.0.
    pub fn process(&mut self, pcm: &mut [f32], suppress: bool) -> f32 {
        let channels = self.states.len();
        if pcm.len() != RNNOISE_FRAME_SIZE * channels {
            return 0.0;
        }

        let mut probability = 0.0f32;
        for (ch, state) in self.states.iter_mut().enumerate() {
            for (i, sample) in self.input.iter_mut().enumerate() {
                *sample = pcm[i * channels + ch] * I16_SCALE;
            }

            let p = state.process_frame(&mut self.output, &self.input);
            probability = probability.max(p);

            if suppress {
                for (i, sample) in self.output.iter().enumerate() {
                    pcm[i * channels + ch] = (sample / I16_SCALE).clamp(-1.0, 1.0);
                }
            }
        }
        probability
    }
}

impl Default for RnnoiseVad {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::audio::VOICE_FRAME_LEN;

    #[test]
    fn test_method_atomic_encoding() {
        for method in [VadMethod::PeakGate, VadMethod::Rnnoise] {
            assert_eq!(VadMethod::from_u8(method.as_u8()), method);
        }
        assert_eq!(VadMethod::from_u8(200), VadMethod::PeakGate);
    }

    #[test]
    fn test_peak_gate() {
        assert!(peak_gate(0.5, 0.1));
        assert!(!peak_gate(0.1, 0.1));
        assert!(!peak_gate(0.0, 0.0));
    }

    #[test]
    fn test_rnnoise_frame_matches_period() {
        assert_eq!(RNNOISE_FRAME_SIZE * VOICE_CHANNELS as usize, VOICE_FRAME_LEN);
    }

    #[test]
    fn test_rnnoise_silence_is_not_speech() {
        let mut vad = RnnoiseVad::new();
        let mut pcm = [0.0f32; VOICE_FRAME_LEN];
        let mut probability = 0.0;
        for _ in 0..10 {
            probability = vad.process(&mut pcm, false);
        }
        assert!((0.0..0.5).contains(&probability));
    }

    #[test]
    fn test_rnnoise_suppress_rewrites_in_range() {
        let mut vad = RnnoiseVad::new();
        let mut pcm: Vec<f32> = (0..VOICE_FRAME_LEN)
            .map(|i| ((i * 7919) % 200) as f32 / 100.0 - 1.0)
            .collect();
        let original = pcm.clone();

        vad.process(&mut pcm, true);
        assert_ne!(pcm, original);
        assert!(pcm.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
    }

    #[test]
    fn test_rnnoise_without_suppress_leaves_input() {
        let mut vad = RnnoiseVad::new();
        let mut pcm = [0.25f32; VOICE_FRAME_LEN];
        vad.process(&mut pcm, false);
        assert!(pcm.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_rnnoise_wrong_length_untouched() {
        let mut vad = RnnoiseVad::new();
        let mut pcm = [0.25f32; 100];
        assert_eq!(vad.process(&mut pcm, true), 0.0);
        assert!(pcm.iter().all(|&s| s == 0.25));
    }
}
