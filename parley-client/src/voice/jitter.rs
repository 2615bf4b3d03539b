//! Jitter buffer for one remote speaker
//!
//! Decoded PCM is queued as it arrives and held back until enough has built
//! up to ride out network jitter. Packets are assumed to arrive in order;
//! late or reordered packets are played where they land.

use std::time::{Duration, Instant};

use parley_common::audio::{ms_to_samples, samples_to_ms};

use super::ring::SampleRing;

/// Gated sample queue feeding the mixer
#[derive(Debug)]
pub struct JitterBuffer {
    ring: SampleRing,
    /// While set, reads return nothing
    buffering: bool,
    /// Samples that must be queued before playback resumes
    desired_samples: usize,
    /// Time since the last write after which buffering gives up waiting
    max_latency: Duration,
    last_write: Option<Instant>,
}

impl JitterBuffer {
    /// Create a buffer
    ///
    /// # Arguments
    /// * `desired_ms` - Audio to accumulate before releasing any
    /// * `max_ms` - Ceiling on queued audio, and on how long buffering waits
    pub fn new(desired_ms: u32, max_ms: u32) -> Self {
        let max_ms = max_ms.max(desired_ms);
        Self {
            ring: SampleRing::new(ms_to_samples(max_ms)),
            buffering: true,
            desired_samples: ms_to_samples(desired_ms),
            max_latency: Duration::from_millis(u64::from(max_ms)),
            last_write: None,
        }
    }

    /// Queue decoded samples
    ///
    /// # Returns
    /// Number of old samples dropped to stay under the max latency
    pub fn write(&mut self, samples: &[f32]) -> usize {
        self.write_at(samples, Instant::now())
    }

    /// Queue decoded samples, with an explicit clock
    pub fn write_at(&mut self, samples: &[f32], now: Instant) -> usize {
        self.last_write = Some(now);
        self.ring.push(samples)
    }

    /// Fill `out` if the buffer is releasing audio
    ///
    /// # Returns
    /// `true` if `out` was filled; `false` means the caller should treat this
    /// speaker as silent for the period
    pub fn read(&mut self, out: &mut [f32]) -> bool {
        self.read_at(out, Instant::now())
    }

    /// Fill `out` if the buffer is releasing audio, with an explicit clock
    pub fn read_at(&mut self, out: &mut [f32], now: Instant) -> bool {
        if self.ring.is_empty() {
            self.buffering = true;
        }

        if self.buffering {
            let stalled = self
                .last_write
                .is_some_and(|t| now.saturating_duration_since(t) > self.max_latency);
            if self.ring.len() >= self.desired_samples || stalled {
                self.buffering = false;
            } else {
                return false;
            }
        }

        self.ring.pop_into(out)
    }

    /// Drop everything queued and start buffering again
    pub fn clear(&mut self) {
        self.ring.clear();
        self.buffering = true;
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Queued samples
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Queued audio in milliseconds
    pub fn buffered_ms(&self) -> u32 {
        samples_to_ms(self.ring.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::audio::VOICE_FRAME_LEN;

    fn frame(value: f32) -> Vec<f32> {
        vec![value; VOICE_FRAME_LEN]
    }

    #[test]
    fn test_starts_buffering() {
        let mut buffer = JitterBuffer::new(40, 200);
        let mut out = frame(0.0);
        assert!(buffer.is_buffering());
        assert!(!buffer.read(&mut out));
    }

    #[test]
    fn test_releases_at_desired_latency() {
        let start = Instant::now();
        let mut buffer = JitterBuffer::new(30, 200);
        let mut out = frame(0.0);

        buffer.write_at(&frame(0.1), start);
        buffer.write_at(&frame(0.2), start);
        assert!(!buffer.read_at(&mut out, start));
        assert_eq!(buffer.buffered_ms(), 20);

        buffer.write_at(&frame(0.3), start);
        assert!(buffer.read_at(&mut out, start));
        assert!(!buffer.is_buffering());
        assert_eq!(out[0], 0.1);
    }

    #[test]
    fn test_reads_continue_below_desired_once_released() {
        let start = Instant::now();
        let mut buffer = JitterBuffer::new(20, 200);
        let mut out = frame(0.0);

        buffer.write_at(&frame(0.1), start);
        buffer.write_at(&frame(0.2), start);
        assert!(buffer.read_at(&mut out, start));
        // 10ms left: below desired, but no longer buffering
        assert!(buffer.read_at(&mut out, start));
        assert_eq!(out[0], 0.2);
    }

    #[test]
    fn test_empty_reenters_buffering() {
        let start = Instant::now();
        let mut buffer = JitterBuffer::new(10, 200);
        let mut out = frame(0.0);

        buffer.write_at(&frame(0.1), start);
        assert!(buffer.read_at(&mut out, start));
        assert!(!buffer.read_at(&mut out, start));
        assert!(buffer.is_buffering());
    }

    #[test]
    fn test_max_latency_escape() {
        let start = Instant::now();
        let mut buffer = JitterBuffer::new(100, 200);
        let mut out = frame(0.0);

        // Only 20ms arrives, then the speaker goes quiet
        buffer.write_at(&frame(0.1), start);
        buffer.write_at(&frame(0.2), start);

        assert!(!buffer.read_at(&mut out, start + Duration::from_millis(150)));
        assert!(!buffer.read_at(&mut out, start + Duration::from_millis(200)));
        // Strictly more than max latency since the last write
        assert!(buffer.read_at(&mut out, start + Duration::from_millis(201)));
        assert_eq!(out[0], 0.1);
    }

    #[test]
    fn test_read_needs_full_period() {
        let start = Instant::now();
        let mut buffer = JitterBuffer::new(0, 200);
        buffer.write_at(&[0.5; 100], start);

        let mut out = frame(0.0);
        assert!(!buffer.read_at(&mut out, start));
        // Nothing was consumed
        assert_eq!(buffer.len(), 100);
    }

    #[test]
    fn test_write_trims_to_max_latency() {
        let mut buffer = JitterBuffer::new(10, 50);
        for i in 0..8 {
            buffer.write(&frame(i as f32));
        }
        assert_eq!(buffer.buffered_ms(), 50);

        // Oldest three frames were dropped
        let mut out = frame(0.0);
        assert!(buffer.read(&mut out));
        assert_eq!(out[0], 3.0);
    }

    #[test]
    fn test_clear() {
        let mut buffer = JitterBuffer::new(10, 200);
        let mut out = frame(0.0);
        buffer.write(&frame(0.1));
        assert!(buffer.read(&mut out));

        buffer.write(&frame(0.1));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.is_buffering());
    }
}
