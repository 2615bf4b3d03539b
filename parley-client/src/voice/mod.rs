//! Real-time voice transport
//!
//! This module provides everything between the sound card and the relay:
//! - Audio device enumeration, capture and playback streams
//! - Opus encoding/decoding
//! - Signaling over the voice gateway WebSocket
//! - Encrypted RTP over UDP with IP discovery
//! - Per-speaker jitter buffering, a decode worker pool and the mixer
//! - VAD gating and noise suppression on the capture side

pub mod audio;
pub mod capture;
pub mod codec;
pub mod crypto;
pub mod decode_pool;
pub mod engine;
pub mod gateway;
pub mod jitter;
pub mod playback;
pub mod ring;
pub mod session;
pub mod speaker;
pub mod transport;
pub mod vad;

use std::sync::atomic::{AtomicU32, Ordering};

/// An f32 stored in an `AtomicU32` by bit pattern
///
/// Audio callbacks read settings through these instead of taking a lock.
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Largest absolute sample value in a buffer
pub fn peak_level(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}
