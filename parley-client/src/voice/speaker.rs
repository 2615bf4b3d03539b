//! Remote speakers and the registry that maps SSRCs to them
//!
//! Each speaker owns exactly one decoder and one jitter buffer, both shared
//! behind `Arc<Mutex<_>>` so an in-flight decode task keeps them alive after
//! the speaker leaves the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use super::AtomicF32;
use super::codec::VoiceDecoder;
use super::jitter::JitterBuffer;
use crate::error::VoiceError;

// =============================================================================
// Speaker
// =============================================================================

/// One remote audio source
pub struct Speaker {
    ssrc: u32,
    user_id: Option<String>,
    decoder: Arc<Mutex<VoiceDecoder>>,
    buffer: Arc<Mutex<JitterBuffer>>,
    muted: AtomicBool,
    gain: AtomicF32,
    /// Peak of the last mixed period, for activity readouts
    level: AtomicF32,
}

impl Speaker {
    /// Create a speaker with a fresh decoder and an empty buffer
    pub fn new(
        ssrc: u32,
        user_id: Option<String>,
        desired_ms: u32,
        max_ms: u32,
    ) -> Result<Self, VoiceError> {
        Ok(Self {
            ssrc,
            user_id,
            decoder: Arc::new(Mutex::new(VoiceDecoder::new()?)),
            buffer: Arc::new(Mutex::new(JitterBuffer::new(desired_ms, max_ms))),
            muted: AtomicBool::new(false),
            gain: AtomicF32::new(1.0),
            level: AtomicF32::new(0.0),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn decoder(&self) -> &Arc<Mutex<VoiceDecoder>> {
        &self.decoder
    }

    pub fn buffer(&self) -> &Arc<Mutex<JitterBuffer>> {
        &self.buffer
    }

    /// Mute or unmute; muting discards whatever is buffered
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        if muted && let Ok(mut buffer) = self.buffer.lock() {
            buffer.clear();
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Set the per-speaker gain multiplier (negative values clamp to 0)
    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.max(0.0));
    }

    pub fn gain(&self) -> f32 {
        self.gain.load()
    }

    /// Peak sample of the most recent period this speaker contributed
    pub fn level(&self) -> f32 {
        self.level.load()
    }

    pub(crate) fn set_level(&self, level: f32) {
        self.level.store(level);
    }
}

// =============================================================================
// Speaker Registry
// =============================================================================

/// Active speakers keyed by SSRC, with a user id index
#[derive(Default)]
pub struct SpeakerRegistry {
    speakers: RwLock<HashMap<u32, Arc<Speaker>>>,
    users: RwLock<HashMap<String, u32>>,
}

impl SpeakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a speaker unless its SSRC is already registered
    ///
    /// # Returns
    /// `true` if the speaker was inserted
    pub fn insert(&self, speaker: Arc<Speaker>) -> bool {
        let Ok(mut speakers) = self.speakers.write() else {
            return false;
        };
        if speakers.contains_key(&speaker.ssrc()) {
            return false;
        }
        if let Some(user_id) = speaker.user_id()
            && let Ok(mut users) = self.users.write()
        {
            users.insert(user_id.to_string(), speaker.ssrc());
        }
        speakers.insert(speaker.ssrc(), speaker);
        true
    }

    pub fn get(&self, ssrc: u32) -> Option<Arc<Speaker>> {
        self.speakers.read().ok()?.get(&ssrc).cloned()
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        self.speakers
            .read()
            .map(|speakers| speakers.contains_key(&ssrc))
            .unwrap_or(false)
    }

    /// SSRC last announced for a user
    pub fn ssrc_for_user(&self, user_id: &str) -> Option<u32> {
        self.users.read().ok()?.get(user_id).copied()
    }

    /// Remove a speaker by SSRC
    pub fn remove(&self, ssrc: u32) -> Option<Arc<Speaker>> {
        let speaker = self.speakers.write().ok()?.remove(&ssrc)?;
        if let Some(user_id) = speaker.user_id()
            && let Ok(mut users) = self.users.write()
            && users.get(user_id) == Some(&ssrc)
        {
            users.remove(user_id);
        }
        Some(speaker)
    }

    /// Remove whichever speaker belongs to a user
    pub fn remove_user(&self, user_id: &str) -> Option<Arc<Speaker>> {
        let ssrc = self.users.write().ok()?.remove(user_id)?;
        self.speakers.write().ok()?.remove(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.speakers.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All speakers, cloned out of the lock
    pub fn all(&self) -> Vec<Arc<Speaker>> {
        self.speakers
            .read()
            .map(|speakers| speakers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Non-blocking read access for the playback callback
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, HashMap<u32, Arc<Speaker>>>> {
        self.speakers.try_read().ok()
    }

    pub fn clear(&self) {
        if let Ok(mut speakers) = self.speakers.write() {
            speakers.clear();
        }
        if let Ok(mut users) = self.users.write() {
            users.clear();
        }
    }
}
