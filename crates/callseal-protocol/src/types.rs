use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// RTP synchronization-source identifier of a media stream.
pub type Ssrc = u32;

/// Length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

// ── Key bundle ────────────────────────────────────────────────────────

/// Public key material a device hands to signaling so a peer can open an
/// encrypted media session with it.
///
/// Keys travel hex-encoded so the bundle survives JSON signaling channels
/// unchanged. At least one of `user_id` / `peer_id` is always set on bundles
/// built by the key manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    /// Hex of the 32-byte Curve25519 identity public key.
    pub identity_key: String,
    /// Hex of the 32-byte Curve25519 ephemeral public key.
    pub ephemeral_key: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub peer_id: Option<String>,
}

impl KeyBundle {
    pub fn new(
        identity_key: &[u8; PUBLIC_KEY_LEN],
        ephemeral_key: &[u8; PUBLIC_KEY_LEN],
        timestamp: u64,
        user_id: Option<String>,
        peer_id: Option<String>,
    ) -> Self {
        Self {
            identity_key: hex::encode(identity_key),
            ephemeral_key: hex::encode(ephemeral_key),
            timestamp,
            user_id,
            peer_id,
        }
    }

    /// Decode the identity public key.
    pub fn identity_key_bytes(&self) -> Result<[u8; PUBLIC_KEY_LEN], ProtocolError> {
        decode_key("identity_key", &self.identity_key)
    }

    /// Decode the ephemeral public key.
    pub fn ephemeral_key_bytes(&self) -> Result<[u8; PUBLIC_KEY_LEN], ProtocolError> {
        decode_key("ephemeral_key", &self.ephemeral_key)
    }

    /// The identifier this bundle is addressed by, preferring the peer id.
    pub fn address(&self) -> Option<&str> {
        self.peer_id.as_deref().or(self.user_id.as_deref())
    }

    /// Check that both keys decode and that the bundle is addressable.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.identity_key_bytes()?;
        self.ephemeral_key_bytes()?;
        if self.address().is_none() {
            return Err(ProtocolError::NotAddressable);
        }
        Ok(())
    }
}

fn decode_key(field: &'static str, hex_str: &str) -> Result<[u8; PUBLIC_KEY_LEN], ProtocolError> {
    let bytes = hex::decode(hex_str).map_err(|source| ProtocolError::InvalidHex { field, source })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ProtocolError::InvalidKeyLength {
            field,
            expected: PUBLIC_KEY_LEN,
            got: bytes.len(),
        })
}
