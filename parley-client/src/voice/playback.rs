//! Playback mixer
//!
//! Called from the output device callback once per period. Every registered
//! speaker contributes one period from its jitter buffer; contributions are
//! summed, scaled by the master gain and hard-clipped. Nothing here blocks:
//! a buffer that is busy, or a registry that is being written, costs that
//! speaker (or the whole period) one period of silence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::speaker::{Speaker, SpeakerRegistry};
use super::{AtomicF32, peak_level};

// =============================================================================
// Controls
// =============================================================================

/// Output-side settings shared with the playback callback
#[derive(Debug)]
pub struct PlaybackControls {
    master_gain: AtomicF32,
    deafened: AtomicBool,
    /// Peak of the last mixed period, after master gain
    level: AtomicF32,
}

impl PlaybackControls {
    pub fn new(master_gain: f32) -> Self {
        Self {
            master_gain: AtomicF32::new(master_gain.max(0.0)),
            deafened: AtomicBool::new(false),
            level: AtomicF32::new(0.0),
        }
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.master_gain.store(gain.max(0.0));
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain.load()
    }

    /// Silence all output; buffered audio is discarded while deafened
    pub fn set_deafened(&self, deafened: bool) {
        self.deafened.store(deafened, Ordering::Relaxed);
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened.load(Ordering::Relaxed)
    }

    pub fn level(&self) -> f32 {
        self.level.load()
    }
}

impl Default for PlaybackControls {
    fn default() -> Self {
        Self::new(1.0)
    }
}

// =============================================================================
// Mixer
// =============================================================================

/// Sums every speaker's buffered audio into the output period
pub struct Mixer {
    registry: Arc<SpeakerRegistry>,
    controls: Arc<PlaybackControls>,
    scratch: Vec<f32>,
}

impl Mixer {
    /// Create a mixer
    ///
    /// # Arguments
    /// * `scratch_len` - Largest chunk mixed in one pass; longer outputs are
    ///   mixed in several chunks
    pub fn new(
        registry: Arc<SpeakerRegistry>,
        controls: Arc<PlaybackControls>,
        scratch_len: usize,
    ) -> Self {
        Self {
            registry,
            controls,
            scratch: vec![0.0; scratch_len.max(1)],
        }
    }

    /// Fill `out` (interleaved stereo) with the next mixed period
    pub fn mix_into(&mut self, out: &mut [f32]) {
        self.mix_into_at(out, Instant::now());
    }

    /// Fill `out` with the next mixed period, with an explicit clock
    pub fn mix_into_at(&mut self, out: &mut [f32], now: Instant) {
        let chunk_len = self.scratch.len();
        for chunk in out.chunks_mut(chunk_len) {
            self.mix_chunk(chunk, now);
        }
        self.controls.level.store(peak_level(out));
    }

    fn mix_chunk(&mut self, out: &mut [f32], now: Instant) {
        out.fill(0.0);

        let Some(speakers) = self.registry.try_read() else {
            return;
        };

        let deafened = self.controls.is_deafened();
        let scratch = &mut self.scratch[..out.len()];

        for speaker in speakers.values() {
            if deafened || speaker.is_muted() {
                discard(speaker);
                continue;
            }

            let filled = match speaker.buffer().try_lock() {
                Ok(mut buffer) => buffer.read_at(scratch, now),
                Err(_) => false,
            };
            if !filled {
                speaker.set_level(0.0);
                continue;
            }

            let gain = speaker.gain();
            if gain != 1.0 {
                for sample in scratch.iter_mut() {
                    *sample *= gain;
                }
            }
            speaker.set_level(peak_level(scratch));

            for (dst, src) in out.iter_mut().zip(scratch.iter()) {
                *dst += *src;
            }
        }
        drop(speakers);

        let master = self.controls.master_gain();
        for sample in out.iter_mut() {
            *sample = (*sample * master).clamp(-1.0, 1.0);
        }
    }
}

/// Drop a speaker's pending audio without waiting on its buffer
fn discard(speaker: &Speaker) {
    if let Ok(mut buffer) = speaker.buffer().try_lock()
        && !buffer.is_empty()
    {
        buffer.clear();
    }
    speaker.set_level(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::audio::VOICE_FRAME_LEN;

    fn registry_with(speakers: &[(u32, f32)]) -> Arc<SpeakerRegistry> {
        let registry = Arc::new(SpeakerRegistry::new());
        for &(ssrc, value) in speakers {
            let speaker = Arc::new(Speaker::new(ssrc, None, 20, 200).unwrap());
            {
                let mut buffer = speaker.buffer().lock().unwrap();
                buffer.write(&vec![value; VOICE_FRAME_LEN * 2]);
            }
            registry.insert(speaker);
        }
        registry
    }

    fn mixer(registry: &Arc<SpeakerRegistry>) -> (Mixer, Arc<PlaybackControls>) {
        let controls = Arc::new(PlaybackControls::default());
        let mixer = Mixer::new(Arc::clone(registry), Arc::clone(&controls), VOICE_FRAME_LEN);
        (mixer, controls)
    }

    #[test]
    fn test_empty_registry_is_silent() {
        let registry = Arc::new(SpeakerRegistry::new());
        let (mut mixer, _) = mixer(&registry);
        let mut out = [1.0f32; VOICE_FRAME_LEN];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_sums_speakers() {
        let registry = registry_with(&[(1, 0.25), (2, 0.125)]);
        let (mut mixer, controls) = mixer(&registry);
        let mut out = [0.0f32; VOICE_FRAME_LEN];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| (s - 0.375).abs() < 1e-6));
        assert!((controls.level() - 0.375).abs() < 1e-6);
        assert!((registry.get(1).unwrap().level() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_output_is_clipped() {
        let registry = registry_with(&[(1, 0.8), (2, 0.8)]);
        let (mut mixer, _) = mixer(&registry);
        let mut out = [0.0f32; VOICE_FRAME_LEN];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_speaker_and_master_gain() {
        let registry = registry_with(&[(1, 0.5)]);
        let (mut mixer, controls) = mixer(&registry);
        registry.get(1).unwrap().set_gain(0.5);
        controls.set_master_gain(2.0);

        let mut out = [0.0f32; VOICE_FRAME_LEN];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_muted_speaker_is_skipped_and_flushed() {
        let registry = registry_with(&[(1, 0.25), (2, 0.125)]);
        let (mut mixer, _) = mixer(&registry);
        let muted = registry.get(2).unwrap();
        muted.set_muted(true);

        let mut out = [0.0f32; VOICE_FRAME_LEN];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert!(muted.buffer().lock().unwrap().is_empty());
        assert_eq!(muted.level(), 0.0);
    }

    #[test]
    fn test_deafen_silences_and_discards() {
        let registry = registry_with(&[(1, 0.25)]);
        let (mut mixer, controls) = mixer(&registry);
        controls.set_deafened(true);

        let mut out = [0.0f32; VOICE_FRAME_LEN];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(registry.get(1).unwrap().buffer().lock().unwrap().is_empty());
    }

    #[test]
    fn test_buffering_speaker_contributes_silence() {
        let registry = Arc::new(SpeakerRegistry::new());
        let speaker = Arc::new(Speaker::new(7, None, 60, 200).unwrap());
        speaker.buffer().lock().unwrap().write(&[0.5; VOICE_FRAME_LEN]);
        registry.insert(Arc::clone(&speaker));
        let (mut mixer, _) = mixer(&registry);

        let mut out = [0.0f32; VOICE_FRAME_LEN];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        // Nothing consumed while below the desired fill
        assert_eq!(speaker.buffer().lock().unwrap().len(), VOICE_FRAME_LEN);
    }

    #[test]
    fn test_busy_buffer_skips_speaker() {
        let registry = registry_with(&[(1, 0.25), (2, 0.125)]);
        let (mut mixer, _) = mixer(&registry);
        let busy = registry.get(1).unwrap();
        let _guard = busy.buffer().lock().unwrap();

        let mut out = [0.0f32; VOICE_FRAME_LEN];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| (s - 0.125).abs() < 1e-6));
    }

    #[test]
    fn test_long_output_mixed_in_chunks() {
        let registry = registry_with(&[(1, 0.25)]);
        let controls = Arc::new(PlaybackControls::default());
        let mut mixer = Mixer::new(Arc::clone(&registry), controls, VOICE_FRAME_LEN / 2);

        let mut out = [0.0f32; VOICE_FRAME_LEN * 2];
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert!(registry.get(1).unwrap().buffer().lock().unwrap().is_empty());
    }
}
