//! Voice settings
//!
//! Device selection, codec and VAD tuning, and buffer sizing for the voice
//! engine. Stored as `voice.json` in the platform config directory.

use std::fs;
use std::path::{Path, PathBuf};

use parley_common::audio::VoiceQuality;
use serde::{Deserialize, Serialize};

use crate::error::VoiceError;
use crate::voice::codec::SignalHint;
use crate::voice::vad::VadMethod;

// =============================================================================
// Constants
// =============================================================================

/// Directory under the platform config dir
pub const APP_DIR_NAME: &str = "parley";

/// Settings file name
pub const SETTINGS_FILE_NAME: &str = "voice.json";

/// System default device identifier
pub const SYSTEM_DEFAULT_DEVICE: &str = "";

/// Upper bound on any gain multiplier
pub const MAX_GAIN: f32 = 4.0;

// =============================================================================
// Voice Settings
// =============================================================================

/// Settings read by the voice engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Input device name (empty string = system default)
    #[serde(default)]
    pub input_device: String,

    /// Output device name (empty string = system default)
    #[serde(default)]
    pub output_device: String,

    /// Opus bitrate preset
    #[serde(default)]
    pub quality: VoiceQuality,

    /// How the capture side decides whether to transmit
    #[serde(default)]
    pub vad_method: VadMethod,

    /// Peak level (0.0-1.0) the gate must exceed to transmit
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,

    /// Speech probability (0.0-1.0) RNNoise must exceed to transmit
    #[serde(default = "default_speech_probability")]
    pub speech_probability: f32,

    /// Software gain applied to captured audio
    #[serde(default = "default_gain")]
    pub capture_gain: f32,

    /// Master gain applied to the playback mix
    #[serde(default = "default_gain")]
    pub playback_gain: f32,

    /// Replace both capture channels with their mean
    #[serde(default)]
    pub mix_mono: bool,

    /// Replace captured audio with RNNoise output when that VAD is active
    #[serde(default = "default_true")]
    pub noise_suppression: bool,

    /// Encoder tuning hint
    #[serde(default)]
    pub signal: SignalHint,

    /// Channels the encoder produces (1 or 2)
    #[serde(default = "default_encoder_channels")]
    pub encoder_channels: u16,

    /// Audio buffered per speaker before playback starts
    #[serde(default = "default_jitter_desired_ms")]
    pub jitter_desired_ms: u32,

    /// Audio buffered per speaker before the oldest is dropped
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u32,

    /// Cap on decode worker threads
    #[serde(default = "default_max_decode_workers")]
    pub max_decode_workers: usize,

    /// Packets that may wait for a decode worker before new ones are dropped
    #[serde(default = "default_decode_queue_capacity")]
    pub decode_queue_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_gain() -> f32 {
    1.0
}

fn default_vad_threshold() -> f32 {
    0.02
}

fn default_speech_probability() -> f32 {
    0.5
}

fn default_encoder_channels() -> u16 {
    2
}

fn default_jitter_desired_ms() -> u32 {
    60
}

fn default_jitter_max_ms() -> u32 {
    400
}

fn default_max_decode_workers() -> usize {
    4
}

fn default_decode_queue_capacity() -> usize {
    256
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            input_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            output_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            quality: VoiceQuality::default(),
            vad_method: VadMethod::default(),
            vad_threshold: default_vad_threshold(),
            speech_probability: default_speech_probability(),
            capture_gain: default_gain(),
            playback_gain: default_gain(),
            mix_mono: false,
            noise_suppression: true,
            signal: SignalHint::default(),
            encoder_channels: default_encoder_channels(),
            jitter_desired_ms: default_jitter_desired_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            max_decode_workers: default_max_decode_workers(),
            decode_queue_capacity: default_decode_queue_capacity(),
        }
    }
}

impl VoiceSettings {
    /// Platform-specific settings file path
    ///
    /// Returns None if the config directory cannot be determined.
    pub fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
    }

    /// Load settings from the default path, falling back to defaults
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load settings from a file, falling back to defaults
    ///
    /// A missing, unreadable or malformed file yields the defaults.
    pub fn load_from(path: &Path) -> Self {
        if path.exists()
            && let Ok(contents) = fs::read_to_string(path)
            && let Ok(settings) = serde_json::from_str::<VoiceSettings>(&contents)
        {
            return settings.sanitized();
        }
        Self::default()
    }

    /// Save settings to the default path
    pub fn save(&self) -> Result<(), VoiceError> {
        let path = Self::settings_path()
            .ok_or_else(|| VoiceError::Io(std::io::Error::other("no config directory")))?;
        self.save_to(&path)
    }

    /// Save settings as pretty JSON, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), VoiceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Clamp values into ranges the engine can run with
    pub fn sanitized(mut self) -> Self {
        self.vad_threshold = self.vad_threshold.clamp(0.0, 1.0);
        self.speech_probability = self.speech_probability.clamp(0.0, 1.0);
        self.capture_gain = self.capture_gain.clamp(0.0, MAX_GAIN);
        self.playback_gain = self.playback_gain.clamp(0.0, MAX_GAIN);
        self.encoder_channels = self.encoder_channels.clamp(1, 2);
        self.jitter_max_ms = self.jitter_max_ms.max(self.jitter_desired_ms);
        self.max_decode_workers = self.max_decode_workers.max(1);
        self.decode_queue_capacity = self.decode_queue_capacity.max(1);
        self
    }

    /// Whether the system default input device is selected
    pub fn is_default_input(&self) -> bool {
        self.input_device.is_empty()
    }

    /// Whether the system default output device is selected
    pub fn is_default_output(&self) -> bool {
        self.output_device.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = VoiceSettings::default();
        assert!(settings.is_default_input());
        assert!(settings.is_default_output());
        assert_eq!(settings.quality, VoiceQuality::High);
        assert_eq!(settings.vad_method, VadMethod::PeakGate);
        assert_eq!(settings.signal, SignalHint::Voice);
        assert_eq!(settings.encoder_channels, 2);
        assert!(settings.jitter_max_ms >= settings.jitter_desired_ms);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: VoiceSettings =
            serde_json::from_str(r#"{"input_device":"USB Microphone"}"#).unwrap();
        assert_eq!(settings.input_device, "USB Microphone");
        assert_eq!(settings.capture_gain, 1.0);
        assert!(settings.noise_suppression);
        assert_eq!(settings.max_decode_workers, 4);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);

        let settings = VoiceSettings {
            output_device: "Headphones".to_string(),
            quality: VoiceQuality::VeryHigh,
            vad_method: VadMethod::Rnnoise,
            mix_mono: true,
            signal: SignalHint::Music,
            jitter_desired_ms: 80,
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        assert_eq!(VoiceSettings::load_from(&path), settings);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert_eq!(VoiceSettings::load_from(&path), VoiceSettings::default());
    }

    #[test]
    fn test_load_invalid_json_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(VoiceSettings::load_from(&path), VoiceSettings::default());
    }

    #[test]
    fn test_sanitized_clamps() {
        let settings = VoiceSettings {
            capture_gain: 12.0,
            encoder_channels: 6,
            jitter_desired_ms: 200,
            jitter_max_ms: 50,
            max_decode_workers: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(settings.capture_gain, MAX_GAIN);
        assert_eq!(settings.encoder_channels, 2);
        assert_eq!(settings.jitter_max_ms, 200);
        assert_eq!(settings.max_decode_workers, 1);
    }
}
