//! Capture pipeline
//!
//! Runs once per 10ms capture period on the audio device thread:
//! downmix, gain, peak meter, VAD (optionally denoising), Opus encode, and
//! hand-off to a `PacketSink`. Settings are read from atomics; the codec and
//! effect state sit behind a mutex that is only ever `try_lock`ed here, so a
//! contended period is skipped rather than waited on.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use parley_common::audio::{
    MAX_OPUS_PACKET_SIZE, VOICE_CHANNELS, VOICE_FRAME_LEN, VOICE_SAMPLES_PER_FRAME,
};

use super::codec::{SignalHint, VoiceEncoder};
use super::transport::PacketSink;
use super::vad::{RnnoiseVad, VadMethod, peak_gate};
use super::{AtomicF32, peak_level};
use crate::config::VoiceSettings;
use crate::error::VoiceError;

// =============================================================================
// Controls
// =============================================================================

/// Lock-free settings and meters shared with the capture callback
#[derive(Debug)]
pub struct CaptureControls {
    gain: AtomicF32,
    vad_method: AtomicU8,
    vad_threshold: AtomicF32,
    speech_probability: AtomicF32,
    mix_mono: AtomicBool,
    noise_suppression: AtomicBool,
    /// Self-mute: when cleared nothing is sent
    transmit: AtomicBool,
    bitrate: AtomicI32,
    encoder_channels: AtomicU16,
    signal: AtomicU8,
    /// Peak of the last processed period, after gain
    peak: AtomicF32,
    voice_active: AtomicBool,
    encode_errors: AtomicU64,
}

impl CaptureControls {
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        let controls = Self {
            gain: AtomicF32::new(1.0),
            vad_method: AtomicU8::new(0),
            vad_threshold: AtomicF32::new(0.0),
            speech_probability: AtomicF32::new(0.0),
            mix_mono: AtomicBool::new(false),
            noise_suppression: AtomicBool::new(false),
            transmit: AtomicBool::new(true),
            bitrate: AtomicI32::new(0),
            encoder_channels: AtomicU16::new(VOICE_CHANNELS),
            signal: AtomicU8::new(0),
            peak: AtomicF32::new(0.0),
            voice_active: AtomicBool::new(false),
            encode_errors: AtomicU64::new(0),
        };
        controls.apply(settings);
        controls
    }

    /// Push new settings to the capture thread
    pub fn apply(&self, settings: &VoiceSettings) {
        self.gain.store(settings.capture_gain);
        self.vad_method
            .store(settings.vad_method.as_u8(), Ordering::Relaxed);
        self.vad_threshold.store(settings.vad_threshold);
        self.speech_probability.store(settings.speech_probability);
        self.mix_mono.store(settings.mix_mono, Ordering::Relaxed);
        self.noise_suppression
            .store(settings.noise_suppression, Ordering::Relaxed);
        self.bitrate
            .store(settings.quality.bitrate(), Ordering::Relaxed);
        self.encoder_channels
            .store(settings.encoder_channels, Ordering::Relaxed);
        self.signal
            .store(signal_to_u8(settings.signal), Ordering::Relaxed);
    }

    pub fn set_transmitting(&self, transmit: bool) {
        self.transmit.store(transmit, Ordering::Relaxed);
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmit.load(Ordering::Relaxed)
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.max(0.0));
    }

    pub fn set_vad_method(&self, method: VadMethod) {
        self.vad_method.store(method.as_u8(), Ordering::Relaxed);
    }

    pub fn set_bitrate(&self, bitrate: i32) {
        self.bitrate.store(bitrate, Ordering::Relaxed);
    }

    /// Peak level (0.0 to 1.0) of the most recent period
    pub fn level(&self) -> f32 {
        self.peak.load()
    }

    /// Whether the most recent period passed VAD
    pub fn voice_active(&self) -> bool {
        self.voice_active.load(Ordering::Relaxed)
    }

    /// Frames that failed to encode since the pipeline started
    pub fn encode_errors(&self) -> u64 {
        self.encode_errors.load(Ordering::Relaxed)
    }

    fn signal(&self) -> SignalHint {
        match self.signal.load(Ordering::Relaxed) {
            1 => SignalHint::Music,
            2 => SignalHint::LowDelay,
            _ => SignalHint::Voice,
        }
    }
}

fn signal_to_u8(signal: SignalHint) -> u8 {
    match signal {
        SignalHint::Voice => 0,
        SignalHint::Music => 1,
        SignalHint::LowDelay => 2,
    }
}

// =============================================================================
// Capture Pipeline
// =============================================================================

/// What happened to one capture period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Encoded and handed to the sink (encoded length)
    Sent(usize),
    /// VAD rejected the period; nothing was sent
    Suppressed,
    /// Transmission is off, the period had the wrong length, or the state
    /// was busy
    Skipped,
    /// The encoder failed; the frame was dropped
    EncodeFailed,
}

struct CaptureState {
    encoder: VoiceEncoder,
    rnnoise: RnnoiseVad,
    work: [f32; VOICE_FRAME_LEN],
    mono: [f32; VOICE_SAMPLES_PER_FRAME as usize],
    packet: [u8; MAX_OPUS_PACKET_SIZE],
    sink: Box<dyn PacketSink>,
}

/// Turns capture periods into outgoing Opus frames
pub struct CapturePipeline {
    controls: Arc<CaptureControls>,
    state: Mutex<CaptureState>,
}

impl CapturePipeline {
    /// Build the pipeline and its encoder from the current controls
    pub fn new(
        controls: Arc<CaptureControls>,
        sink: Box<dyn PacketSink>,
    ) -> Result<Self, VoiceError> {
        let encoder = VoiceEncoder::new(
            controls.encoder_channels.load(Ordering::Relaxed),
            controls.bitrate.load(Ordering::Relaxed),
            controls.signal(),
        )?;
        Ok(Self {
            controls,
            state: Mutex::new(CaptureState {
                encoder,
                rnnoise: RnnoiseVad::new(),
                work: [0.0; VOICE_FRAME_LEN],
                mono: [0.0; VOICE_SAMPLES_PER_FRAME as usize],
                packet: [0u8; MAX_OPUS_PACKET_SIZE],
                sink,
            }),
        })
    }

    pub fn controls(&self) -> &Arc<CaptureControls> {
        &self.controls
    }

    /// Process one interleaved stereo period of `VOICE_FRAME_LEN` samples
    pub fn process_period(&self, input: &[f32]) -> CaptureOutcome {
        let controls = &self.controls;
        if !controls.is_transmitting() || input.len() != VOICE_FRAME_LEN {
            controls.voice_active.store(false, Ordering::Relaxed);
            return CaptureOutcome::Skipped;
        }

        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return CaptureOutcome::Skipped,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let CaptureState {
            encoder,
            rnnoise,
            work,
            mono,
            packet,
            sink,
        } = &mut *state;

        work.copy_from_slice(input);

        if controls.mix_mono.load(Ordering::Relaxed) {
            for pair in work.chunks_exact_mut(2) {
                let mean = (pair[0] + pair[1]) * 0.5;
                pair[0] = mean;
                pair[1] = mean;
            }
        }

        let gain = controls.gain.load();
        if gain != 1.0 {
            for sample in work.iter_mut() {
                *sample = (*sample * gain).clamp(-1.0, 1.0);
            }
        }

        let peak = peak_level(work);
        controls.peak.store(peak);

        let passed = match VadMethod::from_u8(controls.vad_method.load(Ordering::Relaxed)) {
            VadMethod::PeakGate => peak_gate(peak, controls.vad_threshold.load()),
            VadMethod::Rnnoise => {
                let suppress = controls.noise_suppression.load(Ordering::Relaxed);
                let probability = rnnoise.process(work, suppress);
                probability > controls.speech_probability.load()
            }
        };
        controls.voice_active.store(passed, Ordering::Relaxed);
        if !passed {
            return CaptureOutcome::Suppressed;
        }

        if Self::reconfigure(encoder, controls).is_err() {
            controls.encode_errors.fetch_add(1, Ordering::Relaxed);
            return CaptureOutcome::EncodeFailed;
        }

        let encoded = if encoder.channels() == 1 {
            for (dst, pair) in mono.iter_mut().zip(work.chunks_exact(2)) {
                *dst = (pair[0] + pair[1]) * 0.5;
            }
            encoder.encode(mono, packet)
        } else {
            encoder.encode(work, packet)
        };

        match encoded {
            Ok(len) => {
                sink.send_frame(&packet[..len]);
                CaptureOutcome::Sent(len)
            }
            Err(_) => {
                controls.encode_errors.fetch_add(1, Ordering::Relaxed);
                CaptureOutcome::EncodeFailed
            }
        }
    }

    /// Bring the encoder in line with the controls
    ///
    /// Bitrate changes apply in place; channel and signal changes rebuild
    /// the encoder.
    fn reconfigure(encoder: &mut VoiceEncoder, controls: &CaptureControls) -> Result<(), VoiceError> {
        encoder.set_bitrate(controls.bitrate.load(Ordering::Relaxed))?;
        encoder.set_channels(controls.encoder_channels.load(Ordering::Relaxed))?;
        encoder.set_signal(controls.signal())?;
        Ok(())
    }
}
