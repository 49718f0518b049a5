//! Per-frame encryption hooked into the media pipeline.
//!
//! The encryptor sits on the encode/decode transform of every audio and video
//! frame. It never returns an error to the pipeline: a frame it cannot
//! transform is either forwarded unchanged (fail-open) or emptied
//! (fail-closed), depending on [`FailurePolicy`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use callseal_protocol::Ssrc;

use crate::config::{CounterMode, CryptoConfig, FailurePolicy};
pub use crate::media_keys::Direction;
use crate::media_keys::{open_frame, seal_frame, SessionKey};
use crate::session::SessionManager;

/// An encoded media frame as handed over by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    /// Capture timestamp in microseconds.
    pub timestamp_micros: u64,
    /// Synchronization source; 0 when the pipeline did not supply one.
    pub ssrc: Ssrc,
}

impl Frame {
    pub fn new(payload: Vec<u8>, timestamp_micros: u64) -> Self {
        Self {
            payload,
            timestamp_micros,
            ssrc: 0,
        }
    }

    pub fn with_ssrc(mut self, ssrc: Ssrc) -> Self {
        self.ssrc = ssrc;
        self
    }
}

/// Why a frame was not transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoSession,
    CipherFailure,
}

/// What happened to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Encrypted,
    Decrypted,
    /// Payload left untouched.
    PassedThrough(SkipReason),
    /// Payload emptied under [`FailurePolicy::FailClosed`].
    Dropped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub encrypted: u64,
    pub decrypted: u64,
    pub passed_through: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct AtomicStats {
    encrypted: AtomicU64,
    decrypted: AtomicU64,
    passed_through: AtomicU64,
    dropped: AtomicU64,
}

pub struct FrameEncryptor {
    sessions: Arc<SessionManager>,
    policy: FailurePolicy,
    counter_mode: CounterMode,
    enabled: AtomicBool,
    /// peer_id -> [send, receive]. In shared mode only slot 0 is used.
    /// Per-direction mode also encrypts each direction under its own key, so
    /// the two counters can never produce the same (key, nonce) pair.
    counters: DashMap<String, [u32; 2]>,
    stats: AtomicStats,
}

impl FrameEncryptor {
    /// Starts disabled; frames pass through until [`set_enabled`](Self::set_enabled).
    pub fn new(sessions: Arc<SessionManager>, config: &CryptoConfig) -> Self {
        Self {
            sessions,
            policy: config.failure_policy,
            counter_mode: config.counter_mode,
            enabled: AtomicBool::new(false),
            counters: DashMap::new(),
            stats: AtomicStats::default(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        debug!(enabled, "frame encryption toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Encrypt `frame.payload` in place for `peer_id`.
    ///
    /// On success the payload becomes ciphertext followed by the 16-byte tag.
    pub fn encrypt_frame(&self, frame: &mut Frame, peer_id: &str) -> FrameOutcome {
        if !self.is_enabled() {
            return self.pass_through(SkipReason::Disabled);
        }
        let Some(key) = self.key_for(peer_id, Direction::Send) else {
            warn!(peer_id, "no session for outgoing frame");
            return self.fail(frame, SkipReason::NoSession);
        };

        let counter = self.next_counter(peer_id, Direction::Send);
        match seal_frame(&key, frame.timestamp_micros, frame.ssrc, counter, &frame.payload) {
            Ok(ciphertext) => {
                trace!(peer_id, ssrc = frame.ssrc, counter, len = ciphertext.len(), "encrypted frame");
                frame.payload = ciphertext;
                self.stats.encrypted.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Encrypted
            }
            Err(e) => {
                warn!(peer_id, ssrc = frame.ssrc, counter, "frame encryption failed: {e}");
                self.fail(frame, SkipReason::CipherFailure)
            }
        }
    }

    /// Decrypt `frame.payload` in place for `peer_id`.
    pub fn decrypt_frame(&self, frame: &mut Frame, peer_id: &str) -> FrameOutcome {
        if !self.is_enabled() {
            return self.pass_through(SkipReason::Disabled);
        }
        let Some(key) = self.key_for(peer_id, Direction::Receive) else {
            warn!(peer_id, "no session for incoming frame");
            return self.fail(frame, SkipReason::NoSession);
        };

        let counter = self.next_counter(peer_id, Direction::Receive);
        match open_frame(&key, frame.timestamp_micros, frame.ssrc, counter, &frame.payload) {
            Ok(plaintext) => {
                trace!(peer_id, ssrc = frame.ssrc, counter, len = plaintext.len(), "decrypted frame");
                frame.payload = plaintext;
                self.stats.decrypted.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Decrypted
            }
            Err(e) => {
                warn!(peer_id, ssrc = frame.ssrc, counter, "frame decryption failed: {e}");
                self.fail(frame, SkipReason::CipherFailure)
            }
        }
    }

    /// Current counter value for `peer_id` in `direction` (0 if untouched).
    pub fn counter(&self, peer_id: &str, direction: Direction) -> u32 {
        let slot = self.slot(direction);
        self.counters.get(peer_id).map_or(0, |c| c[slot])
    }

    pub fn reset_counter(&self, peer_id: &str) {
        self.counters.remove(peer_id);
    }

    pub fn clear_all_counters(&self) {
        self.counters.clear();
    }

    /// Tear down everything held for `peer_id`: its session and its counters.
    ///
    /// A later session with the same peer derives the same key and counts
    /// from zero again, so the host must not replay (timestamp, ssrc) pairs
    /// it already sent under the earlier session.
    pub fn close_peer(&self, peer_id: &str) {
        self.sessions.close_session(peer_id);
        self.reset_counter(peer_id);
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            encrypted: self.stats.encrypted.load(Ordering::Relaxed),
            decrypted: self.stats.decrypted.load(Ordering::Relaxed),
            passed_through: self.stats.passed_through.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    fn key_for(&self, peer_id: &str, direction: Direction) -> Option<SessionKey> {
        let direction = match self.counter_mode {
            CounterMode::Shared => None,
            CounterMode::PerDirection => Some(direction),
        };
        self.sessions.frame_key(peer_id, direction)
    }

    fn slot(&self, direction: Direction) -> usize {
        match (self.counter_mode, direction) {
            (CounterMode::Shared, _) | (CounterMode::PerDirection, Direction::Send) => 0,
            (CounterMode::PerDirection, Direction::Receive) => 1,
        }
    }

    fn next_counter(&self, peer_id: &str, direction: Direction) -> u32 {
        let slot = self.slot(direction);
        if let Some(mut counters) = self.counters.get_mut(peer_id) {
            counters[slot] = counters[slot].saturating_add(1);
            return counters[slot];
        }
        let mut counters = self.counters.entry(peer_id.to_string()).or_insert([0; 2]);
        counters[slot] = counters[slot].saturating_add(1);
        counters[slot]
    }

    fn pass_through(&self, reason: SkipReason) -> FrameOutcome {
        self.stats.passed_through.fetch_add(1, Ordering::Relaxed);
        FrameOutcome::PassedThrough(reason)
    }

    fn fail(&self, frame: &mut Frame, reason: SkipReason) -> FrameOutcome {
        match self.policy {
            FailurePolicy::FailOpen => self.pass_through(reason),
            FailurePolicy::FailClosed => {
                frame.payload.clear();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Dropped(reason)
            }
        }
    }
}
