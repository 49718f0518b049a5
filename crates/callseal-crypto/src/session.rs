//! Pairwise media sessions.
//!
//! A session turns a peer's key bundle into a symmetric AES-256-GCM key plus a
//! security code the two users can compare out of band. There is at most one
//! session per peer; establishing again for the same peer hands back the
//! existing session untouched.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use callseal_protocol::KeyBundle;

use crate::error::{CryptoError, Result};
use crate::key_manager::KeyManager;
use crate::media_keys::{DirectionalKeys, Direction, SessionKey};
use crate::security_code::security_code;

/// Per-peer session state.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer_id: String,
    pub session_key: SessionKey,
    /// Send/receive keys split from `session_key`, used when the frame path
    /// runs with per-direction counters.
    pub directional: DirectionalKeys,
    /// Protocol-level counter advanced by [`SessionManager::increment_counter`].
    /// The frame path keeps its own counters and does not read this one.
    pub counter: u64,
    pub established: SystemTime,
}

pub struct SessionManager {
    key_manager: Arc<KeyManager>,
    sessions: DashMap<String, Session>,
    security_codes: DashMap<String, String>,
}

impl SessionManager {
    pub fn new(key_manager: Arc<KeyManager>) -> Self {
        Self {
            key_manager,
            sessions: DashMap::new(),
            security_codes: DashMap::new(),
        }
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    /// Agree on a session key with `peer_id` from its key bundle.
    ///
    /// Idempotent per peer: if a session already exists it is returned as-is,
    /// without re-deriving or re-keying.
    ///
    /// The key comes from the two static identity keys only, so closing and
    /// re-establishing a session with the same peer yields the same key. Frame
    /// counters restart at zero after [`FrameEncryptor::close_peer`], and a
    /// frame reusing an earlier (timestamp, ssrc) would then reuse a nonce
    /// under that key.
    ///
    /// [`FrameEncryptor::close_peer`]: crate::frame::FrameEncryptor::close_peer
    pub async fn establish_session(&self, peer_id: &str, peer_bundle: &KeyBundle) -> Result<Session> {
        if let Some(existing) = self.sessions.get(peer_id) {
            debug!(peer_id, "session already established");
            return Ok(existing.clone());
        }

        let peer_identity = peer_bundle.identity_key_bytes()?;
        let local_identity = self.key_manager.get_identity_public_key()?;
        let shared = self.key_manager.compute_shared_secret(&peer_identity)?;
        let session_key = SessionKey::derive(&shared)?;
        let directional = session_key.directional(&local_identity, &peer_identity)?;

        // A concurrent establish for the same peer may have won the race.
        let session = match self.sessions.entry(peer_id.to_string()) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                self.security_codes.insert(
                    peer_id.to_string(),
                    security_code(&local_identity, &peer_identity),
                );
                entry
                    .insert(Session {
                        peer_id: peer_id.to_string(),
                        session_key,
                        directional,
                        counter: 0,
                        established: SystemTime::now(),
                    })
                    .clone()
            }
        };

        info!(peer_id, "established media session");
        Ok(session)
    }

    pub fn get_session(&self, peer_id: &str) -> Option<Session> {
        self.sessions.get(peer_id).map(|s| s.clone())
    }

    /// Key the frame path encrypts under: the session key itself, or one of
    /// its directional halves.
    pub(crate) fn frame_key(&self, peer_id: &str, direction: Option<Direction>) -> Option<SessionKey> {
        self.sessions.get(peer_id).map(|s| match direction {
            None => s.session_key.clone(),
            Some(direction) => s.directional.for_direction(direction).clone(),
        })
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    /// `None` means the session is still being negotiated.
    pub fn get_security_code(&self, peer_id: &str) -> Option<String> {
        self.security_codes.get(peer_id).map(|c| c.clone())
    }

    /// Advance and return the session's protocol counter.
    pub fn increment_counter(&self, peer_id: &str) -> Result<u64> {
        let mut session = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::SessionNotFound(peer_id.to_string()))?;
        session.counter += 1;
        Ok(session.counter)
    }

    /// Peers with an established session.
    pub fn peers(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Unknown peers are ignored.
    pub fn close_session(&self, peer_id: &str) {
        let removed = self.sessions.remove(peer_id).is_some();
        self.security_codes.remove(peer_id);
        if removed {
            info!(peer_id, "closed media session");
        }
    }

    pub fn close_all_sessions(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        self.security_codes.clear();
        info!(count, "closed all media sessions");
    }
}
