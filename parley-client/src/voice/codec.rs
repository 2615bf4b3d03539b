//! Opus codec wrappers
//!
//! The encoder turns interleaved f32 PCM into Opus frames for the capture
//! side; the decoder turns a remote speaker's frames back into interleaved
//! stereo PCM for the jitter buffer. Neither allocates per frame: callers
//! pass in the output buffers.

use opus::{Application, Bitrate, Channels, Decoder, Encoder};
use parley_common::audio::{MAX_OPUS_FRAME_SAMPLES, VOICE_CHANNELS, VOICE_SAMPLE_RATE};
use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

// =============================================================================
// Constants
// =============================================================================

/// Frame lengths (samples per channel at 48kHz) Opus accepts: 2.5 to 60ms
const VALID_FRAME_SIZES: [usize; 6] = [120, 240, 480, 960, 1920, 2880];

/// Interleaved stereo samples needed to hold the longest decodable frame
pub const MAX_DECODED_LEN: usize = MAX_OPUS_FRAME_SAMPLES * VOICE_CHANNELS as usize;

// =============================================================================
// Signal Hint
// =============================================================================

/// What the encoder should optimise for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalHint {
    /// Speech intelligibility (Opus VOIP mode)
    #[default]
    Voice,
    /// Full-band fidelity (Opus audio mode)
    Music,
    /// Lowest algorithmic delay
    LowDelay,
}

impl SignalHint {
    fn application(self) -> Application {
        match self {
            SignalHint::Voice => Application::Voip,
            SignalHint::Music => Application::Audio,
            SignalHint::LowDelay => Application::LowDelay,
        }
    }
}

fn opus_channels(channels: u16) -> Channels {
    if channels == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    }
}

// =============================================================================
// Voice Encoder
// =============================================================================

/// Opus encoder for outgoing audio
pub struct VoiceEncoder {
    encoder: Encoder,
    channels: u16,
    bitrate: i32,
    signal: SignalHint,
}

impl VoiceEncoder {
    /// Create an encoder
    ///
    /// # Arguments
    /// * `channels` - 1 or 2; anything else is treated as stereo
    /// * `bitrate` - Target bitrate in bits per second
    /// * `signal` - Tuning hint
    pub fn new(channels: u16, bitrate: i32, signal: SignalHint) -> Result<Self, VoiceError> {
        let channels = if channels == 1 { 1 } else { 2 };
        let encoder = Self::build(channels, bitrate, signal)?;
        Ok(Self {
            encoder,
            channels,
            bitrate,
            signal,
        })
    }

    fn build(channels: u16, bitrate: i32, signal: SignalHint) -> Result<Encoder, VoiceError> {
        let mut encoder = Encoder::new(
            VOICE_SAMPLE_RATE,
            opus_channels(channels),
            signal.application(),
        )
        .map_err(|e| VoiceError::Codec(format!("Failed to create Opus encoder: {}", e)))?;
        encoder
            .set_bitrate(Bitrate::Bits(bitrate))
            .map_err(|e| VoiceError::Codec(format!("Failed to set bitrate: {}", e)))?;
        Ok(encoder)
    }

    /// Change the bitrate without resetting codec state
    pub fn set_bitrate(&mut self, bitrate: i32) -> Result<(), VoiceError> {
        if bitrate == self.bitrate {
            return Ok(());
        }
        self.encoder
            .set_bitrate(Bitrate::Bits(bitrate))
            .map_err(|e| VoiceError::Codec(format!("Failed to set bitrate: {}", e)))?;
        self.bitrate = bitrate;
        Ok(())
    }

    /// Change the channel count; recreates the encoder
    pub fn set_channels(&mut self, channels: u16) -> Result<(), VoiceError> {
        let channels = if channels == 1 { 1 } else { 2 };
        if channels == self.channels {
            return Ok(());
        }
        self.encoder = Self::build(channels, self.bitrate, self.signal)?;
        self.channels = channels;
        Ok(())
    }

    /// Change the tuning hint; recreates the encoder
    pub fn set_signal(&mut self, signal: SignalHint) -> Result<(), VoiceError> {
        if signal == self.signal {
            return Ok(());
        }
        self.encoder = Self::build(self.channels, self.bitrate, signal)?;
        self.signal = signal;
        Ok(())
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bitrate(&self) -> i32 {
        self.bitrate
    }

    pub fn signal(&self) -> SignalHint {
        self.signal
    }

    /// Encode one frame of interleaved PCM
    ///
    /// # Arguments
    /// * `pcm` - Interleaved samples in [-1.0, 1.0] for `channels()` channels
    /// * `out` - Destination for the Opus frame
    ///
    /// # Returns
    /// * `Ok(len)` - Bytes written to `out`
    /// * `Err(VoiceError::Codec)` - Invalid frame length or encoder failure
    pub fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, VoiceError> {
        let channels = self.channels as usize;
        let per_channel = pcm.len() / channels;
        if pcm.len() % channels != 0 || !VALID_FRAME_SIZES.contains(&per_channel) {
            return Err(VoiceError::Codec(format!(
                "Invalid frame length: {} samples for {} channel(s)",
                pcm.len(),
                channels
            )));
        }

        self.encoder
            .encode_float(pcm, out)
            .map_err(|e| VoiceError::Codec(format!("Opus encode error: {}", e)))
    }
}

// =============================================================================
// Voice Decoder
// =============================================================================

/// Opus decoder for one remote speaker
///
/// Always produces interleaved stereo regardless of what the sender encoded.
pub struct VoiceDecoder {
    decoder: Decoder,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self, VoiceError> {
        let decoder = Decoder::new(VOICE_SAMPLE_RATE, opus_channels(VOICE_CHANNELS))
            .map_err(|e| VoiceError::Codec(format!("Failed to create Opus decoder: {}", e)))?;
        Ok(Self { decoder })
    }

    /// Decode one Opus frame
    ///
    /// # Arguments
    /// * `data` - Encoded frame
    /// * `out` - Destination; should hold `MAX_DECODED_LEN` samples
    ///
    /// # Returns
    /// * `Ok(len)` - Interleaved samples written to `out`
    /// * `Err(VoiceError::Codec)` - Corrupt frame; decoder state is kept
    pub fn decode_into(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize, VoiceError> {
        let per_channel = self
            .decoder
            .decode_float(data, out, false)
            .map_err(|e| VoiceError::Codec(format!("Opus decode error: {}", e)))?;
        Ok(per_channel * VOICE_CHANNELS as usize)
    }
}

// =============================================================================
// Tests
// =============================================================================
