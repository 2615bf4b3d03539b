//! Decode worker pool
//!
//! The transport receive thread must never block on Opus, so incoming
//! payloads are queued as `DecodeTask`s on a bounded channel and decoded by a
//! small set of worker threads. The pool is sized to the number of active
//! speakers, up to a cap.
//!
//! Workers are only ever stopped cooperatively: each `Terminate` job retires
//! exactly one worker, which reports its id back before exiting so the pool
//! can join the right thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use parley_common::rtp::strip_header_extension;
use tracing::{debug, warn};

use super::codec::{MAX_DECODED_LEN, VoiceDecoder};
use super::jitter::JitterBuffer;
use super::speaker::Speaker;
use crate::error::VoiceError;

/// How long to wait for a worker to acknowledge termination
const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Decode Task
// =============================================================================

/// One received payload bound to the speaker it belongs to
pub struct DecodeTask {
    payload: Vec<u8>,
    received_at: Instant,
    decoder: Arc<Mutex<VoiceDecoder>>,
    buffer: Arc<Mutex<JitterBuffer>>,
}

impl DecodeTask {
    /// Bind a decrypted RTP payload to a speaker
    pub fn new(payload: Vec<u8>, received_at: Instant, speaker: &Speaker) -> Self {
        Self {
            payload,
            received_at,
            decoder: Arc::clone(speaker.decoder()),
            buffer: Arc::clone(speaker.buffer()),
        }
    }

    /// Strip any header extension, decode, and queue the PCM
    ///
    /// # Arguments
    /// * `scratch` - Decode buffer of at least `MAX_DECODED_LEN` samples
    ///
    /// # Returns
    /// Interleaved samples written to the speaker's buffer
    pub fn run(&self, scratch: &mut [f32]) -> Result<usize, VoiceError> {
        let payload = strip_header_extension(&self.payload)?;

        let samples = {
            let mut decoder = self
                .decoder
                .lock()
                .map_err(|_| VoiceError::Codec("decoder lock poisoned".to_string()))?;
            decoder.decode_into(payload, scratch)?
        };

        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.write_at(&scratch[..samples], self.received_at);
        }
        Ok(samples)
    }
}

enum DecodeJob {
    Decode(DecodeTask),
    Terminate,
}

// =============================================================================
// Decode Pool
// =============================================================================

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

/// Resizable set of decode threads fed by a bounded queue
pub struct DecodePool {
    job_tx: Sender<DecodeJob>,
    job_rx: Receiver<DecodeJob>,
    exit_tx: Sender<usize>,
    exit_rx: Receiver<usize>,
    workers: Vec<Worker>,
    max_workers: usize,
    next_id: usize,
    processed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

/// Cloneable sending half of a pool's queue
///
/// Lets the receive thread queue work without holding whatever lock guards
/// the pool itself while it is being resized.
#[derive(Clone)]
pub struct DecodeSubmitter {
    job_tx: Sender<DecodeJob>,
    dropped: Arc<AtomicU64>,
}

impl DecodeSubmitter {
    /// Queue a task without blocking
    ///
    /// # Returns
    /// `false` if the queue is full and the task was dropped
    pub fn submit(&self, task: DecodeTask) -> bool {
        match self.job_tx.try_send(DecodeJob::Decode(task)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl DecodePool {
    /// Create an empty pool
    ///
    /// # Arguments
    /// * `max_workers` - Cap on worker threads
    /// * `queue_capacity` - Jobs that may wait before `submit` starts dropping
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        let (job_tx, job_rx) = bounded(queue_capacity.max(1));
        let (exit_tx, exit_rx) = unbounded();
        Self {
            job_tx,
            job_rx,
            exit_tx,
            exit_rx,
            workers: Vec::new(),
            max_workers: max_workers.max(1),
            next_id: 0,
            processed: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start one more worker, unless already at the cap
    ///
    /// # Returns
    /// `true` if a worker was started
    pub fn add_worker(&mut self) -> Result<bool, VoiceError> {
        if self.workers.len() >= self.max_workers {
            return Ok(false);
        }

        let id = self.next_id;
        let job_rx = self.job_rx.clone();
        let exit_tx = self.exit_tx.clone();
        let processed = Arc::clone(&self.processed);

        let handle = thread::Builder::new()
            .name(format!("parley-decode-{}", id))
            .spawn(move || worker_loop(id, job_rx, exit_tx, processed))?;

        self.next_id += 1;
        self.workers.push(Worker { id, handle });
        debug!(worker = id, total = self.workers.len(), "decode worker started");
        Ok(true)
    }

    /// Retire one worker and wait for it to exit
    ///
    /// A no-op on an empty pool. Jobs already queued ahead of the
    /// termination request are still decoded.
    pub fn remove_worker(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        if self.job_tx.send(DecodeJob::Terminate).is_err() {
            return;
        }
        self.join_exited(1);
    }

    /// Grow or shrink towards `target` workers, capped at the maximum
    pub fn resize(&mut self, target: usize) -> Result<(), VoiceError> {
        let target = target.min(self.max_workers);
        while self.workers.len() < target {
            if !self.add_worker()? {
                break;
            }
        }
        while self.workers.len() > target {
            self.remove_worker();
        }
        Ok(())
    }

    /// Stop every worker and discard anything left in the queue
    ///
    /// Jobs submitted before the call are decoded first, since each
    /// termination request queues behind them.
    pub fn clear(&mut self) {
        let count = self.workers.len();
        for _ in 0..count {
            if self.job_tx.send(DecodeJob::Terminate).is_err() {
                break;
            }
        }
        self.join_exited(count);

        // Anything still queued was submitted with no workers left to run it
        let leftover = self.job_rx.try_iter().count();
        if leftover > 0 {
            debug!(leftover, "discarded queued decode jobs");
        }
    }

    /// Handle for queueing tasks from another thread
    pub fn submitter(&self) -> DecodeSubmitter {
        DecodeSubmitter {
            job_tx: self.job_tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Queue a task without blocking; `false` if it was dropped
    pub fn submit(&self, task: DecodeTask) -> bool {
        self.submitter().submit(task)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.job_rx.len()
    }

    /// Tasks decoded since the pool was created
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Tasks rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn join_exited(&mut self, count: usize) {
        for _ in 0..count {
            let Ok(id) = self.exit_rx.recv_timeout(WORKER_EXIT_TIMEOUT) else {
                warn!("decode worker did not exit in time");
                break;
            };
            if let Some(pos) = self.workers.iter().position(|w| w.id == id) {
                let worker = self.workers.swap_remove(pos);
                if worker.handle.join().is_err() {
                    warn!(worker = id, "decode worker panicked");
                }
                debug!(worker = id, total = self.workers.len(), "decode worker stopped");
            }
        }
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.clear();
    }
}

fn worker_loop(
    id: usize,
    job_rx: Receiver<DecodeJob>,
    exit_tx: Sender<usize>,
    processed: Arc<AtomicU64>,
) {
    let mut scratch = vec![0f32; MAX_DECODED_LEN];

    while let Ok(job) = job_rx.recv() {
        match job {
            DecodeJob::Decode(task) => {
                match task.run(&mut scratch) {
                    Ok(_) => {}
                    Err(VoiceError::Wire(e)) => debug!(worker = id, "dropping packet: {}", e),
                    Err(e) => warn!(worker = id, "decode failed: {}", e),
                }
                processed.fetch_add(1, Ordering::Relaxed);
            }
            DecodeJob::Terminate => break,
        }
    }

    let _ = exit_tx.send(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::codec::{SignalHint, VoiceEncoder};
    use parley_common::audio::{MAX_OPUS_PACKET_SIZE, VOICE_FRAME_LEN, ms_to_samples};

    fn encoded_frame() -> Vec<u8> {
        let mut encoder = VoiceEncoder::new(2, 64000, SignalHint::Voice).unwrap();
        let mut packet = [0u8; MAX_OPUS_PACKET_SIZE];
        let len = encoder.encode(&[0.1; VOICE_FRAME_LEN], &mut packet).unwrap();
        packet[..len].to_vec()
    }

    #[test]
    fn test_task_writes_into_speaker_buffer() {
        let speaker = Speaker::new(1, None, 10, 1000).unwrap();
        let task = DecodeTask::new(encoded_frame(), Instant::now(), &speaker);
        let mut scratch = vec![0f32; MAX_DECODED_LEN];

        assert_eq!(task.run(&mut scratch).unwrap(), VOICE_FRAME_LEN);
        assert_eq!(speaker.buffer().lock().unwrap().len(), VOICE_FRAME_LEN);
    }

    #[test]
    fn test_task_strips_header_extension() {
        let speaker = Speaker::new(1, None, 10, 1000).unwrap();
        let mut payload = vec![0xBE, 0xDE, 0x00, 0x01, 0x10, 0xAA, 0x00, 0x00];
        payload.extend_from_slice(&encoded_frame());

        let task = DecodeTask::new(payload, Instant::now(), &speaker);
        let mut scratch = vec![0f32; MAX_DECODED_LEN];
        assert_eq!(task.run(&mut scratch).unwrap(), VOICE_FRAME_LEN);
    }

    #[test]
    fn test_each_task_processed_exactly_once() {
        let speaker = Speaker::new(1, None, 10, 2000).unwrap();
        let frame = encoded_frame();
        let mut pool = DecodePool::new(3, 256);
        pool.resize(3).unwrap();

        let count = 100;
        let submitter = pool.submitter();
        thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..count {
                    assert!(submitter.submit(DecodeTask::new(
                        frame.clone(),
                        Instant::now(),
                        &speaker
                    )));
                }
            });
        });
        pool.clear();

        assert_eq!(pool.processed(), count as u64);
        assert_eq!(
            speaker.buffer().lock().unwrap().len(),
            ms_to_samples(10) * count
        );
    }

    #[test]
    fn test_remove_worker_on_empty_pool_is_noop() {
        let mut pool = DecodePool::new(2, 8);
        pool.remove_worker();
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn test_resize_respects_cap() {
        let mut pool = DecodePool::new(2, 8);
        pool.resize(5).unwrap();
        assert_eq!(pool.worker_count(), 2);
        assert!(!pool.add_worker().unwrap());

        pool.resize(1).unwrap();
        assert_eq!(pool.worker_count(), 1);
        pool.resize(0).unwrap();
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn test_clear_empties_pool_and_queue() {
        let speaker = Speaker::new(1, None, 10, 1000).unwrap();
        let mut pool = DecodePool::new(2, 8);

        // No workers yet: tasks wait in the queue
        for _ in 0..3 {
            pool.submit(DecodeTask::new(vec![0xF8, 0xFF, 0xFE], Instant::now(), &speaker));
        }
        assert_eq!(pool.queued(), 3);

        pool.clear();
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_submit_drops_when_full() {
        let speaker = Speaker::new(1, None, 10, 1000).unwrap();
        let pool = DecodePool::new(1, 2);
        let frame = vec![0xF8, 0xFF, 0xFE];

        assert!(pool.submit(DecodeTask::new(frame.clone(), Instant::now(), &speaker)));
        assert!(pool.submit(DecodeTask::new(frame.clone(), Instant::now(), &speaker)));
        assert!(!pool.submit(DecodeTask::new(frame, Instant::now(), &speaker)));
        assert_eq!(pool.dropped(), 1);
    }

    #[test]
    fn test_corrupt_payload_does_not_kill_worker() {
        let speaker = Speaker::new(1, None, 10, 1000).unwrap();
        let mut pool = DecodePool::new(1, 8);
        pool.resize(1).unwrap();

        pool.submit(DecodeTask::new(vec![0x03], Instant::now(), &speaker));
        pool.submit(DecodeTask::new(encoded_frame(), Instant::now(), &speaker));
        pool.clear();

        assert_eq!(pool.processed(), 2);
        assert_eq!(speaker.buffer().lock().unwrap().len(), VOICE_FRAME_LEN);
    }
}
