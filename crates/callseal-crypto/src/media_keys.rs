//! Symmetric AES-256-GCM encryption for media frame payloads.
//!
//! Session keys are derived per peer from the X25519 shared secret. Nonces
//! are built deterministically from frame metadata plus a per-peer counter,
//! so nothing but the ciphertext and its tag travels with the frame.

use hkdf::Hkdf;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

/// AES-256-GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;

/// Maximum frame counter before the session MUST be renegotiated.
/// At 50 audio frames/sec plus 30 video frames/sec this is over 600 days;
/// past it nonce uniqueness under the same key cannot be guaranteed.
pub const MAX_FRAME_COUNTER: u32 = u32::MAX - 1000;

const HKDF_SALT: &[u8] = b"callseal-media-v1";
const HKDF_INFO: &[u8] = b"callseal session key";
const DIRECTIONAL_INFO: &[u8] = b"callseal directional key";

/// Which way a frame travels relative to the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// A per-peer 256-bit AES-GCM key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

impl SessionKey {
    /// Derive the session key from an X25519 shared secret with HKDF-SHA256.
    pub fn derive(shared_secret: &[u8; 32]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
        let mut okm = [0u8; 32];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(Self(okm))
    }

    /// Split the session key into one key per direction.
    ///
    /// The sender's identity key is bound into the HKDF info, so the local
    /// send key equals the peer's receive key and the two directions never
    /// encrypt under the same key.
    pub fn directional(
        &self,
        local_identity: &[u8; 32],
        peer_identity: &[u8; 32],
    ) -> Result<DirectionalKeys> {
        Ok(DirectionalKeys {
            send: self.expand_directional(local_identity, peer_identity)?,
            receive: self.expand_directional(peer_identity, local_identity)?,
        })
    }

    fn expand_directional(&self, sender: &[u8; 32], receiver: &[u8; 32]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::from_prk(&self.0).map_err(|_| CryptoError::KeyDerivationFailed)?;
        let mut okm = [0u8; 32];
        hk.expand_multi_info(&[DIRECTIONAL_INFO, &sender[..], &receiver[..]], &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(Self(okm))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create an AES-256-GCM key from the raw bytes.
    fn to_aead_key(&self) -> Result<LessSafeKey> {
        let unbound =
            UnboundKey::new(&AES_256_GCM, &self.0).map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(LessSafeKey::new(unbound))
    }
}

/// Send and receive keys derived from one session key.
#[derive(Debug, Clone)]
pub struct DirectionalKeys {
    pub send: SessionKey,
    pub receive: SessionKey,
}

impl DirectionalKeys {
    pub fn for_direction(&self, direction: Direction) -> &SessionKey {
        match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.receive,
        }
    }
}

/// Construct the 12-byte nonce for a frame.
///
/// Nonce = timestamp_low32(4) || ssrc(4) || counter(4), all big-endian.
pub fn build_nonce(timestamp: u64, ssrc: u32, counter: u32) -> [u8; NONCE_LEN] {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes[0..4].copy_from_slice(&(timestamp as u32).to_be_bytes());
    nonce_bytes[4..8].copy_from_slice(&ssrc.to_be_bytes());
    nonce_bytes[8..12].copy_from_slice(&counter.to_be_bytes());
    nonce_bytes
}

/// Encrypt a frame payload with AES-256-GCM.
///
/// Returns the ciphertext with the 16-byte authentication tag appended.
/// `(timestamp, ssrc, counter)` must never repeat under the same key.
pub fn seal_frame(
    key: &SessionKey,
    timestamp: u64,
    ssrc: u32,
    counter: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if counter >= MAX_FRAME_COUNTER {
        return Err(CryptoError::CounterExhausted(counter));
    }

    let aead_key = key.to_aead_key()?;
    let nonce = Nonce::assume_unique_for_key(build_nonce(timestamp, ssrc, counter));

    let mut in_out = Vec::with_capacity(plaintext.len() + GCM_TAG_SIZE);
    in_out.extend_from_slice(plaintext);
    aead_key
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(in_out)
}

/// Decrypt a frame payload produced by [`seal_frame`].
///
/// Fails if the tag does not verify, which includes any mismatch in key,
/// timestamp, ssrc or counter.
pub fn open_frame(
    key: &SessionKey,
    timestamp: u64,
    ssrc: u32,
    counter: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < GCM_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let aead_key = key.to_aead_key()?;
    let nonce = Nonce::assume_unique_for_key(build_nonce(timestamp, ssrc, counter));

    let mut in_out = ciphertext.to_vec();
    let plaintext_len = aead_key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::DecryptionFailed)?
        .len();
    in_out.truncate(plaintext_len);

    Ok(in_out)
}
