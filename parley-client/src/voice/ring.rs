//! Bounded sample queue
//!
//! Backing store for the jitter buffer. Storage is allocated once up front;
//! pushing past capacity discards the oldest samples so a stalled reader can
//! never grow memory.

use std::collections::VecDeque;

/// Fixed-capacity FIFO of interleaved f32 samples
#[derive(Debug)]
pub struct SampleRing {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleRing {
    /// Create a ring holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append samples, dropping the oldest on overflow
    ///
    /// # Returns
    /// Number of samples discarded to make room
    pub fn push(&mut self, input: &[f32]) -> usize {
        // Only the newest `capacity` samples of an oversized write can survive
        let input = if input.len() > self.capacity {
            &input[input.len() - self.capacity..]
        } else {
            input
        };

        let overflow = (self.samples.len() + input.len()).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(input.iter().copied());
        overflow
    }

    /// Fill `out` completely from the front of the ring
    ///
    /// Nothing is consumed unless enough samples are queued.
    pub fn pop_into(&mut self, out: &mut [f32]) -> bool {
        if self.samples.len() < out.len() {
            return false;
        }
        let n = out.len();
        for (dst, src) in out.iter_mut().zip(self.samples.drain(..n)) {
            *dst = src;
        }
        true
    }

    /// Discard up to `count` samples from the front
    pub fn drop_front(&mut self, count: usize) -> usize {
        let count = count.min(self.samples.len());
        self.samples.drain(..count);
        count
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
