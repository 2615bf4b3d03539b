//! Audio format shared by capture, transport and playback
//!
//! All PCM moving through the engine is interleaved stereo f32 at 48kHz.
//! The capture side works in 10ms periods; remote senders may use any Opus
//! frame length up to 120ms.

use serde::{Deserialize, Serialize};

/// Sample rate for voice audio (48kHz, required by Opus)
pub const VOICE_SAMPLE_RATE: u32 = 48000;

/// Number of interleaved channels carried through the engine
pub const VOICE_CHANNELS: u16 = 2;

/// Capture period duration in milliseconds
pub const VOICE_FRAME_DURATION_MS: u32 = 10;

/// Samples per channel in one capture period (480 at 48kHz)
pub const VOICE_SAMPLES_PER_FRAME: u32 = VOICE_SAMPLE_RATE * VOICE_FRAME_DURATION_MS / 1000;

/// Interleaved samples in one capture period
pub const VOICE_FRAME_LEN: usize = VOICE_SAMPLES_PER_FRAME as usize * VOICE_CHANNELS as usize;

/// Longest Opus frame (120ms) in samples per channel
pub const MAX_OPUS_FRAME_SAMPLES: usize = 5760;

/// Largest encoded Opus frame we ever produce or accept
pub const MAX_OPUS_PACKET_SIZE: usize = 1275;

/// RTP payload type used for Opus audio
pub const OPUS_PAYLOAD_TYPE: u8 = 0x78;

/// Opus "silence" frame sent to open the NAT path after key exchange
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Number of silence frames sent after the session description arrives
pub const SILENCE_FRAME_COUNT: usize = 5;

/// Interleaved samples per millisecond of engine audio
pub const SAMPLES_PER_MS: usize = (VOICE_SAMPLE_RATE as usize / 1000) * VOICE_CHANNELS as usize;

/// Convert a count of interleaved samples to whole milliseconds
pub fn samples_to_ms(samples: usize) -> u32 {
    (samples / SAMPLES_PER_MS) as u32
}

/// Convert milliseconds to a count of interleaved samples
pub fn ms_to_samples(ms: u32) -> usize {
    ms as usize * SAMPLES_PER_MS
}

/// Voice quality presets (Opus bitrate in bits per second)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VoiceQuality {
    /// Low quality: 24 kbps
    Low = 24000,
    /// Medium quality: 48 kbps
    Medium = 48000,
    /// High quality: 64 kbps - default for stereo voice
    #[default]
    High = 64000,
    /// Very high quality: 128 kbps
    VeryHigh = 128000,
}

impl VoiceQuality {
    /// Get the bitrate in bits per second
    pub fn bitrate(self) -> i32 {
        self as i32
    }

    /// Get all quality levels
    pub fn all() -> &'static [VoiceQuality] {
        &[
            VoiceQuality::Low,
            VoiceQuality::Medium,
            VoiceQuality::High,
            VoiceQuality::VeryHigh,
        ]
    }
}

impl std::fmt::Display for VoiceQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} kbps", self.bitrate() / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constants() {
        assert_eq!(VOICE_SAMPLES_PER_FRAME, 480);
        assert_eq!(VOICE_FRAME_LEN, 960);
        assert_eq!(SAMPLES_PER_MS, 96);
    }

    #[test]
    fn test_sample_duration_conversion() {
        assert_eq!(samples_to_ms(VOICE_FRAME_LEN), VOICE_FRAME_DURATION_MS);
        assert_eq!(ms_to_samples(20), 1920);
        // Partial milliseconds round down
        assert_eq!(samples_to_ms(95), 0);
    }

    #[test]
    fn test_quality_bitrates_ascending() {
        let rates: Vec<i32> = VoiceQuality::all().iter().map(|q| q.bitrate()).collect();
        let mut sorted = rates.clone();
        sorted.sort();
        assert_eq!(rates, sorted);
        assert_eq!(VoiceQuality::default(), VoiceQuality::High);
    }

    #[test]
    fn test_quality_serde_roundtrip() {
        let json = serde_json::to_string(&VoiceQuality::VeryHigh).unwrap();
        let back: VoiceQuality = serde_json::from_str(&json).unwrap();
        assert_eq!(back, VoiceQuality::VeryHigh);
    }
}
