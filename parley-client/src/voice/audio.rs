//! Audio device management and streaming
//!
//! Device enumeration plus capture and playback streams built on cpal. The
//! engine works in interleaved stereo f32 at 48kHz; devices that only offer
//! mono (or more than two channels) are adapted at the callback boundary.
//!
//! Callbacks run on cpal's audio thread. Everything they touch is allocated
//! before the stream starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Host, Sample, SampleFormat, Stream, StreamConfig,
    SupportedStreamConfigRange,
};
use parley_common::audio::{VOICE_CHANNELS, VOICE_FRAME_LEN, VOICE_SAMPLE_RATE};
use tracing::{debug, info};

use crate::error::VoiceError;

// =============================================================================
// Constants
// =============================================================================

/// System default device display name
pub const SYSTEM_DEFAULT_DEVICE_NAME: &str = "System Default";

/// Sample formats the stream builders can convert
const SUPPORTED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

/// Stereo frames rendered per playback chunk
const PLAYBACK_CHUNK_FRAMES: usize = 2048;

// =============================================================================
// Audio Device
// =============================================================================

/// Represents an audio device (input or output)
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name for display
    pub name: String,
    /// Whether this represents the system default device
    pub is_default: bool,
}

impl AudioDevice {
    pub fn new(name: String, is_default: bool) -> Self {
        Self { name, is_default }
    }

    /// The "System Default" entry
    pub fn system_default() -> Self {
        Self {
            name: SYSTEM_DEFAULT_DEVICE_NAME.to_string(),
            is_default: true,
        }
    }
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for AudioDevice {}

// =============================================================================
// Device Enumeration
// =============================================================================

fn get_host() -> Host {
    cpal::default_host()
}

fn device_name(device: &Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

fn collect_devices(devices: impl Iterator<Item = Device>) -> Vec<AudioDevice> {
    let mut list = vec![AudioDevice::system_default()];
    for name in devices.filter_map(|d| device_name(&d)) {
        if !list.iter().any(|d| d.name == name) {
            list.push(AudioDevice::new(name, false));
        }
    }
    list
}

/// List available audio output devices, "System Default" first
pub fn list_output_devices() -> Vec<AudioDevice> {
    match get_host().output_devices() {
        Ok(devices) => collect_devices(devices),
        Err(_) => vec![AudioDevice::system_default()],
    }
}

/// List available audio input devices, "System Default" first
pub fn list_input_devices() -> Vec<AudioDevice> {
    match get_host().input_devices() {
        Ok(devices) => collect_devices(devices),
        Err(_) => vec![AudioDevice::system_default()],
    }
}

fn is_default_name(name: &str) -> bool {
    name.is_empty() || name == SYSTEM_DEFAULT_DEVICE_NAME
}

/// Find an output device by name, falling back to the default
fn find_output_device(name: &str) -> Option<Device> {
    let host = get_host();

    if is_default_name(name) {
        return host.default_output_device();
    }

    host.output_devices()
        .ok()?
        .find(|d| device_name(d).is_some_and(|n| n == name))
        .or_else(|| host.default_output_device())
}

/// Find an input device by name, falling back to the default
fn find_input_device(name: &str) -> Option<Device> {
    let host = get_host();

    if is_default_name(name) {
        return host.default_input_device();
    }

    host.input_devices()
        .ok()?
        .find(|d| device_name(d).is_some_and(|n| n == name))
        .or_else(|| host.default_input_device())
}

// =============================================================================
// Config Selection
// =============================================================================

fn supports_voice_rate(range: &SupportedStreamConfigRange) -> bool {
    range.min_sample_rate() <= VOICE_SAMPLE_RATE && range.max_sample_rate() >= VOICE_SAMPLE_RATE
}

fn format_rank(format: SampleFormat) -> usize {
    SUPPORTED_FORMATS
        .iter()
        .position(|f| *f == format)
        .unwrap_or(SUPPORTED_FORMATS.len())
}

/// Pick a channel count and sample format for a device
///
/// Prefers stereo over mono over anything wider, and F32 over I16 over U16.
/// Only ranges that include 48kHz qualify, except on Windows where WASAPI
/// shared mode resamples for us.
pub(crate) fn choose_config(ranges: &[SupportedStreamConfigRange]) -> Option<(u16, SampleFormat)> {
    let usable = |r: &&SupportedStreamConfigRange| SUPPORTED_FORMATS.contains(&r.sample_format());
    let best = |rate_ok: bool| {
        ranges
            .iter()
            .filter(usable)
            .filter(|r| !rate_ok || supports_voice_rate(r))
            .min_by_key(|r| {
                let channel_rank = match r.channels() {
                    2 => 0,
                    1 => 1,
                    _ => 2,
                };
                (channel_rank, format_rank(r.sample_format()))
            })
            .map(|r| (r.channels(), r.sample_format()))
    };

    let chosen = best(true);
    #[cfg(target_os = "windows")]
    let chosen = chosen.or_else(|| best(false));
    chosen
}

fn describe_rates(ranges: &[SupportedStreamConfigRange]) -> String {
    let rates: Vec<String> = ranges
        .iter()
        .map(|c| {
            if c.min_sample_rate() == c.max_sample_rate() {
                format!("{}Hz", c.min_sample_rate())
            } else {
                format!("{}-{}Hz", c.min_sample_rate(), c.max_sample_rate())
            }
        })
        .collect();
    if rates.is_empty() {
        "unknown".to_string()
    } else {
        rates.join(", ")
    }
}

fn stream_config(channels: u16) -> StreamConfig {
    StreamConfig {
        channels,
        sample_rate: VOICE_SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    }
}

// =============================================================================
// Capture Device
// =============================================================================

/// Microphone input delivering fixed 10ms stereo periods
pub struct CaptureDevice {
    stream: Stream,
    active: Arc<AtomicBool>,
    error_rx: std_mpsc::Receiver<String>,
}

impl CaptureDevice {
    /// Open an input device
    ///
    /// # Arguments
    /// * `device_name` - Device name, or empty string for system default
    /// * `on_period` - Called with each `VOICE_FRAME_LEN` interleaved stereo
    ///   period, on the audio thread
    pub fn open<F>(device_name: &str, on_period: F) -> Result<Self, VoiceError>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        let device = find_input_device(device_name)
            .ok_or_else(|| VoiceError::Device("Input device not found".to_string()))?;

        let ranges: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| VoiceError::Device(format!("Failed to get supported configs: {}", e)))?
            .collect();
        let (channels, sample_format) = choose_config(&ranges).ok_or_else(|| {
            VoiceError::Device(format!(
                "Input device doesn't support 48kHz. Device supports: {}",
                describe_rates(&ranges)
            ))
        })?;

        let config = stream_config(channels);
        let active = Arc::new(AtomicBool::new(false));
        let (error_tx, error_rx) = std_mpsc::channel();
        let framer = PeriodFramer::new(channels, on_period);

        let stream = match sample_format {
            SampleFormat::F32 => {
                build_capture_stream::<f32, F>(&device, &config, framer, active.clone(), error_tx)
            }
            SampleFormat::I16 => {
                build_capture_stream::<i16, F>(&device, &config, framer, active.clone(), error_tx)
            }
            SampleFormat::U16 => {
                build_capture_stream::<u16, F>(&device, &config, framer, active.clone(), error_tx)
            }
            other => {
                return Err(VoiceError::Device(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        }?;

        info!(
            device = %device_name_or_default(device_name),
            channels,
            format = ?sample_format,
            "capture device opened"
        );

        Ok(Self {
            stream,
            active,
            error_rx,
        })
    }

    /// Start delivering periods
    pub fn start(&self) -> Result<(), VoiceError> {
        self.active.store(true, Ordering::SeqCst);
        self.stream
            .play()
            .map_err(|e| VoiceError::Device(format!("Failed to start capture: {}", e)))
    }

    /// Stop delivering periods; the stream stays open
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Err(e) = self.stream.pause() {
            debug!("capture pause failed: {}", e);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// First stream error reported by the audio thread, if any
    pub fn check_error(&self) -> Option<String> {
        self.error_rx.try_recv().ok()
    }
}

/// Regroups device buffers of any size into whole stereo periods
struct PeriodFramer<F> {
    channels: usize,
    period: [f32; VOICE_FRAME_LEN],
    filled: usize,
    on_period: F,
}

impl<F: FnMut(&[f32])> PeriodFramer<F> {
    fn new(channels: u16, on_period: F) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            period: [0.0; VOICE_FRAME_LEN],
            filled: 0,
            on_period,
        }
    }

    /// Feed one device buffer of interleaved samples
    fn push<T>(&mut self, data: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        for frame in data.chunks_exact(self.channels) {
            let left = f32::from_sample(frame[0]);
            let right = frame.get(1).map_or(left, |s| f32::from_sample(*s));
            self.period[self.filled] = left;
            self.period[self.filled + 1] = right;
            self.filled += usize::from(VOICE_CHANNELS);

            if self.filled == VOICE_FRAME_LEN {
                (self.on_period)(&self.period);
                self.filled = 0;
            }
        }
    }

    fn reset(&mut self) {
        self.filled = 0;
    }
}

fn build_capture_stream<T, F>(
    device: &Device,
    config: &StreamConfig,
    mut framer: PeriodFramer<F>,
    active: Arc<AtomicBool>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
    F: FnMut(&[f32]) + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if active.load(Ordering::Relaxed) {
                    framer.push(data);
                } else {
                    framer.reset();
                }
            },
            move |err| {
                let _ = error_tx.send(format!("Audio capture error: {}", err));
            },
            None,
        )
        .map_err(|e| VoiceError::Device(format!("Failed to build input stream: {}", e)))
}

// =============================================================================
// Playback Device
// =============================================================================

/// Speaker output pulling interleaved stereo from a render callback
pub struct PlaybackDevice {
    stream: Stream,
    active: Arc<AtomicBool>,
    error_rx: std_mpsc::Receiver<String>,
}

impl PlaybackDevice {
    /// Open an output device
    ///
    /// # Arguments
    /// * `device_name` - Device name, or empty string for system default
    /// * `render` - Fills an interleaved stereo buffer, on the audio thread
    pub fn open<F>(device_name: &str, render: F) -> Result<Self, VoiceError>
    where
        F: FnMut(&mut [f32]) + Send + 'static,
    {
        let device = find_output_device(device_name)
            .ok_or_else(|| VoiceError::Device("Output device not found".to_string()))?;

        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| VoiceError::Device(format!("Failed to get supported configs: {}", e)))?
            .collect();
        let (channels, sample_format) = choose_config(&ranges).ok_or_else(|| {
            VoiceError::Device(format!(
                "Output device doesn't support 48kHz. Device supports: {}",
                describe_rates(&ranges)
            ))
        })?;

        let config = stream_config(channels);
        let active = Arc::new(AtomicBool::new(false));
        let (error_tx, error_rx) = std_mpsc::channel();
        let renderer = ChannelAdapter::new(channels, render);

        let stream = match sample_format {
            SampleFormat::F32 => {
                build_playback_stream::<f32, F>(&device, &config, renderer, active.clone(), error_tx)
            }
            SampleFormat::I16 => {
                build_playback_stream::<i16, F>(&device, &config, renderer, active.clone(), error_tx)
            }
            SampleFormat::U16 => {
                build_playback_stream::<u16, F>(&device, &config, renderer, active.clone(), error_tx)
            }
            other => {
                return Err(VoiceError::Device(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        }?;

        info!(
            device = %device_name_or_default(device_name),
            channels,
            format = ?sample_format,
            "playback device opened"
        );

        Ok(Self {
            stream,
            active,
            error_rx,
        })
    }

    /// Start pulling audio from the render callback
    pub fn start(&self) -> Result<(), VoiceError> {
        self.active.store(true, Ordering::SeqCst);
        self.stream
            .play()
            .map_err(|e| VoiceError::Device(format!("Failed to start playback: {}", e)))
    }

    /// Stop playback; the device receives silence until paused
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Err(e) = self.stream.pause() {
            debug!("playback pause failed: {}", e);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// First stream error reported by the audio thread, if any
    pub fn check_error(&self) -> Option<String> {
        self.error_rx.try_recv().ok()
    }
}

/// Maps the engine's stereo render output onto the device channel layout
struct ChannelAdapter<F> {
    channels: usize,
    stereo: Vec<f32>,
    render: F,
}

impl<F: FnMut(&mut [f32])> ChannelAdapter<F> {
    fn new(channels: u16, render: F) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            stereo: vec![0.0; PLAYBACK_CHUNK_FRAMES * usize::from(VOICE_CHANNELS)],
            render,
        }
    }

    /// Render into a device buffer of interleaved samples
    fn fill<T>(&mut self, data: &mut [T])
    where
        T: Sample + FromSample<f32>,
    {
        let channels = self.channels;
        for chunk in data.chunks_mut(PLAYBACK_CHUNK_FRAMES * channels) {
            let frames = chunk.len() / channels;
            let stereo = &mut self.stereo[..frames * usize::from(VOICE_CHANNELS)];
            (self.render)(stereo);

            for (frame, pair) in chunk.chunks_exact_mut(channels).zip(stereo.chunks_exact(2)) {
                match channels {
                    1 => frame[0] = T::from_sample((pair[0] + pair[1]) * 0.5),
                    _ => {
                        frame[0] = T::from_sample(pair[0]);
                        frame[1] = T::from_sample(pair[1]);
                        for extra in &mut frame[2..] {
                            *extra = T::EQUILIBRIUM;
                        }
                    }
                }
            }
        }
    }
}

fn build_playback_stream<T, F>(
    device: &Device,
    config: &StreamConfig,
    mut renderer: ChannelAdapter<F>,
    active: Arc<AtomicBool>,
    error_tx: std_mpsc::Sender<String>,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
    F: FnMut(&mut [f32]) + Send + 'static,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if active.load(Ordering::Relaxed) {
                    renderer.fill(data);
                } else {
                    data.fill(T::EQUILIBRIUM);
                }
            },
            move |err| {
                let _ = error_tx.send(format!("Audio playback error: {}", err));
            },
            None,
        )
        .map_err(|e| VoiceError::Device(format!("Failed to build output stream: {}", e)))
}

fn device_name_or_default(name: &str) -> &str {
    if is_default_name(name) {
        SYSTEM_DEFAULT_DEVICE_NAME
    } else {
        name
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::SupportedBufferSize;
    use serial_test::serial;

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(channels, min, max, SupportedBufferSize::Unknown, format)
    }

    #[test]
    fn test_audio_device_system_default() {
        let device = AudioDevice::system_default();
        assert_eq!(device.name, SYSTEM_DEFAULT_DEVICE_NAME);
        assert!(device.is_default);
    }

    #[test]
    fn test_audio_device_equality() {
        let device1 = AudioDevice::new("Test".to_string(), false);
        let device2 = AudioDevice::new("Test".to_string(), true);
        let device3 = AudioDevice::new("Other".to_string(), false);

        assert_eq!(device1, device2);
        assert_ne!(device1, device3);
    }

    #[test]
    fn test_choose_config_prefers_stereo_f32() {
        let ranges = [
            range(1, 8000, 48000, SampleFormat::F32),
            range(2, 44100, 48000, SampleFormat::I16),
            range(2, 48000, 48000, SampleFormat::F32),
        ];
        assert_eq!(choose_config(&ranges), Some((2, SampleFormat::F32)));
    }

    #[test]
    fn test_choose_config_falls_back_to_mono() {
        let ranges = [
            range(2, 44100, 44100, SampleFormat::F32),
            range(1, 48000, 48000, SampleFormat::U16),
        ];
        assert_eq!(choose_config(&ranges), Some((1, SampleFormat::U16)));
    }

    #[test]
    fn test_choose_config_accepts_wide_devices() {
        let ranges = [range(6, 48000, 48000, SampleFormat::I16)];
        assert_eq!(choose_config(&ranges), Some((6, SampleFormat::I16)));
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_choose_config_requires_voice_rate() {
        let ranges = [range(2, 44100, 44100, SampleFormat::F32)];
        assert_eq!(choose_config(&ranges), None);
        assert_eq!(describe_rates(&ranges), "44100Hz");
    }

    #[test]
    fn test_framer_upmixes_mono_into_periods() {
        let mut periods: Vec<Vec<f32>> = Vec::new();
        let mut framer = PeriodFramer::new(1, |p: &[f32]| periods.push(p.to_vec()));

        // 1.5 periods in uneven device buffers
        let samples: Vec<f32> = (0..720).map(|i| i as f32 / 1000.0).collect();
        framer.push(&samples[..100]);
        framer.push(&samples[100..]);
        drop(framer);

        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].len(), VOICE_FRAME_LEN);
        assert_eq!(periods[0][0], periods[0][1]);
        assert_eq!(periods[0][958], 479.0 / 1000.0);
    }

    #[test]
    fn test_framer_keeps_first_two_channels() {
        let mut periods: Vec<Vec<f32>> = Vec::new();
        let mut framer = PeriodFramer::new(4, |p: &[f32]| periods.push(p.to_vec()));
        let samples: Vec<i16> = [i16::MAX, 0, 1, 1].repeat(480);
        framer.push(&samples);
        drop(framer);

        assert_eq!(periods.len(), 1);
        assert!((periods[0][0] - 1.0).abs() < 1e-3);
        assert_eq!(periods[0][1], 0.0);
    }

    #[test]
    fn test_adapter_downmixes_to_mono() {
        let mut adapter = ChannelAdapter::new(1, |out: &mut [f32]| {
            for pair in out.chunks_exact_mut(2) {
                pair[0] = 0.5;
                pair[1] = 0.25;
            }
        });
        let mut data = [0.0f32; 64];
        adapter.fill(&mut data);
        assert!(data.iter().all(|&s| (s - 0.375).abs() < 1e-6));
    }

    #[test]
    fn test_adapter_silences_extra_channels() {
        let mut adapter = ChannelAdapter::new(3, |out: &mut [f32]| out.fill(0.5));
        let mut data = [1.0f32; 30];
        adapter.fill(&mut data);
        for frame in data.chunks_exact(3) {
            assert_eq!(frame, &[0.5, 0.5, 0.0]);
        }
    }

    #[test]
    fn test_adapter_renders_large_buffers_in_chunks() {
        let mut calls = 0;
        let mut adapter = ChannelAdapter::new(2, |out: &mut [f32]| {
            calls += 1;
            out.fill(0.1);
        });
        let mut data = vec![0.0f32; (PLAYBACK_CHUNK_FRAMES + 10) * 2];
        adapter.fill(&mut data);
        drop(adapter);
        assert_eq!(calls, 2);
        assert!(data.iter().all(|&s| s == 0.1));
    }

    #[test]
    #[serial]
    fn test_list_output_devices_includes_default() {
        let devices = list_output_devices();
        assert!(!devices.is_empty());
        assert!(devices[0].is_default);
        assert_eq!(devices[0].name, SYSTEM_DEFAULT_DEVICE_NAME);
    }

    #[test]
    #[serial]
    fn test_list_input_devices_includes_default() {
        let devices = list_input_devices();
        assert!(!devices.is_empty());
        assert!(devices[0].is_default);
        assert_eq!(devices[0].name, SYSTEM_DEFAULT_DEVICE_NAME);
    }
}
