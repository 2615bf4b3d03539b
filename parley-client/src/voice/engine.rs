//! Voice engine
//!
//! The single long-lived handle shared by signaling, the transport receive
//! thread and both audio pipelines. It owns the speaker registry, the decode
//! pool and the lock-free controls, and it is the only source of
//! `VoiceEvent`s.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use parley_common::audio::OPUS_PAYLOAD_TYPE;
use parley_common::rtp::RtpHeader;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::capture::CaptureControls;
use super::decode_pool::{DecodePool, DecodeSubmitter, DecodeTask};
use super::gateway::SignalingState;
use super::playback::PlaybackControls;
use super::speaker::{Speaker, SpeakerRegistry};
use super::transport::ReceiveHandler;
use crate::config::VoiceSettings;
use crate::error::VoiceError;

// =============================================================================
// Voice Events
// =============================================================================

/// Notifications for whoever owns the engine
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// Signaling moved to a new state
    StateChanged(SignalingState),
    /// Media is flowing; `ssrc` is ours
    Connected { ssrc: u32 },
    SpeakerJoined {
        ssrc: u32,
        user_id: Option<String>,
    },
    SpeakerLeft {
        ssrc: u32,
        user_id: Option<String>,
    },
    /// A speaker started or stopped producing audible output
    SpeakerActivity {
        ssrc: u32,
        user_id: Option<String>,
        speaking: bool,
    },
    /// An audio device failed; the other direction keeps running
    DeviceError(String),
    /// The session ended, with a reason if it was not requested
    Disconnected(Option<String>),
}

// =============================================================================
// Voice Engine
// =============================================================================

struct EngineInner {
    settings: RwLock<VoiceSettings>,
    registry: Arc<SpeakerRegistry>,
    pool: Mutex<DecodePool>,
    submitter: DecodeSubmitter,
    capture: Arc<CaptureControls>,
    playback: Arc<PlaybackControls>,
    /// Our own SSRC, so relayed copies of our audio are ignored
    local_ssrc: AtomicU32,
    /// SSRCs whose speaker was removed; late packets from them are dropped
    /// until the relay maps them again
    departed: Mutex<HashSet<u32>>,
    events: mpsc::UnboundedSender<VoiceEvent>,
}

/// Cloneable handle to the shared voice state
#[derive(Clone)]
pub struct VoiceEngine {
    inner: Arc<EngineInner>,
}

impl VoiceEngine {
    /// Create the engine and the receiver its events are delivered to
    pub fn new(settings: VoiceSettings) -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let settings = settings.sanitized();
        let (events, event_rx) = mpsc::unbounded_channel();
        let pool = DecodePool::new(settings.max_decode_workers, settings.decode_queue_capacity);
        let submitter = pool.submitter();

        let inner = EngineInner {
            registry: Arc::new(SpeakerRegistry::new()),
            pool: Mutex::new(pool),
            submitter,
            capture: Arc::new(CaptureControls::from_settings(&settings)),
            playback: Arc::new(PlaybackControls::new(settings.playback_gain)),
            local_ssrc: AtomicU32::new(0),
            departed: Mutex::new(HashSet::new()),
            events,
            settings: RwLock::new(settings),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            event_rx,
        )
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> VoiceSettings {
        self.inner
            .settings
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Replace the settings and push them to the running pipelines
    ///
    /// Device and jitter changes take effect on the next connection.
    pub fn update_settings(&self, settings: VoiceSettings) {
        let settings = settings.sanitized();
        self.inner.capture.apply(&settings);
        self.inner.playback.set_master_gain(settings.playback_gain);
        if let Ok(mut current) = self.inner.settings.write() {
            *current = settings;
        }
    }

    pub fn registry(&self) -> &Arc<SpeakerRegistry> {
        &self.inner.registry
    }

    pub fn capture_controls(&self) -> &Arc<CaptureControls> {
        &self.inner.capture
    }

    pub fn playback_controls(&self) -> &Arc<PlaybackControls> {
        &self.inner.playback
    }

    /// Deliver an event to the owner; dropped if nobody is listening
    pub fn emit(&self, event: VoiceEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn set_local_ssrc(&self, ssrc: u32) {
        self.inner.local_ssrc.store(ssrc, Ordering::Relaxed);
    }

    pub fn local_ssrc(&self) -> u32 {
        self.inner.local_ssrc.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Speakers
    // -------------------------------------------------------------------------

    /// Register a remote speaker and grow the decode pool to match
    ///
    /// Explicitly adding an SSRC lifts any earlier departure, so a user who
    /// rejoins with the same SSRC is heard again.
    ///
    /// # Returns
    /// `false` if the SSRC was already registered
    pub fn add_speaker(&self, ssrc: u32, user_id: Option<String>) -> Result<bool, VoiceError> {
        if let Ok(mut departed) = self.inner.departed.lock() {
            departed.remove(&ssrc);
        }
        if self.inner.registry.contains(ssrc) {
            return Ok(false);
        }

        let (desired_ms, max_ms) = {
            let settings = self.settings();
            (settings.jitter_desired_ms, settings.jitter_max_ms)
        };
        let speaker = Arc::new(Speaker::new(ssrc, user_id.clone(), desired_ms, max_ms)?);
        if !self.inner.registry.insert(speaker) {
            return Ok(false);
        }

        self.resize_pool()?;
        info!(ssrc, user = ?user_id, "speaker joined");
        self.emit(VoiceEvent::SpeakerJoined { ssrc, user_id });
        Ok(true)
    }

    /// Drop a speaker and shrink the decode pool
    ///
    /// In-flight decode tasks for the speaker still complete against its
    /// (now unreachable) buffer.
    pub fn remove_speaker(&self, ssrc: u32) -> bool {
        let Some(speaker) = self.inner.registry.remove(ssrc) else {
            return false;
        };
        self.speaker_removed(&speaker);
        true
    }

    /// Drop whichever speaker belongs to `user_id`
    pub fn remove_user(&self, user_id: &str) -> bool {
        let Some(speaker) = self.inner.registry.remove_user(user_id) else {
            return false;
        };
        self.speaker_removed(&speaker);
        true
    }

    /// Create an anonymous speaker for an SSRC the receive path reported
    ///
    /// Runs on the session thread. Our own SSRC and departed SSRCs are
    /// refused.
    ///
    /// # Returns
    /// `true` if a speaker was created
    pub fn admit_unknown(&self, ssrc: u32) -> Result<bool, VoiceError> {
        if ssrc == self.local_ssrc() || self.is_departed(ssrc) {
            debug!(ssrc, "not admitting departed or local ssrc");
            return Ok(false);
        }
        self.add_speaker(ssrc, None)
    }

    /// Whether the speaker for `ssrc` was removed and not mapped again
    pub fn is_departed(&self, ssrc: u32) -> bool {
        self.inner
            .departed
            .lock()
            .map(|departed| departed.contains(&ssrc))
            .unwrap_or(false)
    }

    fn speaker_removed(&self, speaker: &Speaker) {
        if let Ok(mut departed) = self.inner.departed.lock() {
            departed.insert(speaker.ssrc());
        }
        if let Err(e) = self.resize_pool() {
            warn!("failed to resize decode pool: {}", e);
        }
        info!(ssrc = speaker.ssrc(), user = ?speaker.user_id(), "speaker left");
        self.emit(VoiceEvent::SpeakerLeft {
            ssrc: speaker.ssrc(),
            user_id: speaker.user_id().map(str::to_string),
        });
    }

    fn resize_pool(&self) -> Result<(), VoiceError> {
        let target = self.inner.registry.len();
        let mut pool = self
            .inner
            .pool
            .lock()
            .map_err(|_| VoiceError::Protocol("decode pool lock poisoned".to_string()))?;
        pool.resize(target)
    }

    /// Number of running decode workers
    pub fn decode_workers(&self) -> usize {
        self.inner.pool.lock().map(|p| p.worker_count()).unwrap_or(0)
    }

    pub fn set_speaker_muted(&self, ssrc: u32, muted: bool) -> bool {
        match self.inner.registry.get(ssrc) {
            Some(speaker) => {
                speaker.set_muted(muted);
                true
            }
            None => false,
        }
    }

    pub fn set_speaker_gain(&self, ssrc: u32, gain: f32) -> bool {
        match self.inner.registry.get(ssrc) {
            Some(speaker) => {
                speaker.set_gain(gain);
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Controls and levels
    // -------------------------------------------------------------------------

    /// Mute all playback
    pub fn set_deafened(&self, deafened: bool) {
        self.inner.playback.set_deafened(deafened);
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.inner.playback.set_master_gain(gain);
    }

    /// Stop or resume sending microphone audio
    pub fn set_transmitting(&self, transmitting: bool) {
        self.inner.capture.set_transmitting(transmitting);
    }

    /// Peak level of the most recent capture period, after gain
    pub fn capture_level(&self) -> f32 {
        self.inner.capture.level()
    }

    /// Peak level a speaker contributed to the most recent mix
    pub fn speaker_level(&self, ssrc: u32) -> Option<f32> {
        self.inner.registry.get(ssrc).map(|s| s.level())
    }

    // -------------------------------------------------------------------------
    // Receive path
    // -------------------------------------------------------------------------

    /// Route one decrypted RTP payload to its speaker's decoder
    ///
    /// Called on the receive thread, so it never creates speakers or touches
    /// the decode pool's size. Packets from an SSRC without a speaker are
    /// dropped and reported as `RtpRoute::UnknownSpeaker`.
    pub fn handle_rtp(&self, header: &RtpHeader, payload: &[u8], received_at: Instant) -> RtpRoute {
        if header.payload_type != OPUS_PAYLOAD_TYPE {
            debug!(payload_type = header.payload_type, "dropping non-Opus packet");
            return RtpRoute::Dropped;
        }
        if header.ssrc == self.local_ssrc() {
            return RtpRoute::Dropped;
        }

        let Some(speaker) = self.inner.registry.get(header.ssrc) else {
            if self.is_departed(header.ssrc) {
                return RtpRoute::Dropped;
            }
            return RtpRoute::UnknownSpeaker;
        };
        if speaker.is_muted() {
            return RtpRoute::Dropped;
        }

        let task = DecodeTask::new(payload.to_vec(), received_at, &speaker);
        if !self.inner.submitter.submit(task) {
            debug!(ssrc = header.ssrc, "decode queue full, dropping packet");
            return RtpRoute::Dropped;
        }
        RtpRoute::Queued
    }

    /// Handler that feeds the transport receive thread into this engine
    ///
    /// Unknown SSRCs and fatal socket errors go to `notices`, to be acted on
    /// by the session thread.
    pub fn receive_handler(&self, notices: mpsc::UnboundedSender<ReceiveNotice>) -> EngineReceiver {
        EngineReceiver {
            engine: self.clone(),
            notices,
            announced: HashSet::new(),
        }
    }

    /// Drop every speaker and stop the decode workers
    pub fn shutdown(&self) {
        for speaker in self.inner.registry.all() {
            self.remove_speaker(speaker.ssrc());
        }
        if let Ok(mut pool) = self.inner.pool.lock() {
            pool.clear();
        }
        if let Ok(mut departed) = self.inner.departed.lock() {
            departed.clear();
        }
        self.set_local_ssrc(0);
    }
}

/// What the receive path did with one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpRoute {
    /// Handed to the decode pool
    Queued,
    /// Filtered out, muted, departed, or the decode queue was full
    Dropped,
    /// No speaker owns this SSRC yet
    UnknownSpeaker,
}

/// Work the receive thread hands to the session thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveNotice {
    /// Audio is arriving from an SSRC that has no speaker
    UnknownSsrc(u32),
    /// The UDP socket failed and the receive thread has stopped
    TransportFailed(String),
}

/// `ReceiveHandler` wrapper around a `VoiceEngine`
pub struct EngineReceiver {
    engine: VoiceEngine,
    notices: mpsc::UnboundedSender<ReceiveNotice>,
    /// SSRCs already reported and not yet seen with a speaker
    announced: HashSet<u32>,
}

impl ReceiveHandler for EngineReceiver {
    fn on_packet(&mut self, header: RtpHeader, payload: &[u8], received_at: Instant) {
        match self.engine.handle_rtp(&header, payload, received_at) {
            RtpRoute::UnknownSpeaker => {
                if self.announced.insert(header.ssrc) {
                    let _ = self.notices.send(ReceiveNotice::UnknownSsrc(header.ssrc));
                }
            }
            RtpRoute::Queued => {
                if !self.announced.is_empty() {
                    self.announced.remove(&header.ssrc);
                }
            }
            RtpRoute::Dropped => {}
        }
    }

    fn on_error(&mut self, error: VoiceError) {
        let _ = self
            .notices
            .send(ReceiveNotice::TransportFailed(error.to_string()));
    }
}
