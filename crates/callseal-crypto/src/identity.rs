//! Curve25519 key pairs and their persisted form.
//!
//! Each callseal device has a long-term identity key pair generated on first
//! launch and persisted across restarts, plus a short-lived ephemeral key pair
//! that is only ever held in memory.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use callseal_protocol::PUBLIC_KEY_LEN;

use crate::error::{CryptoError, Result};

/// An X25519 key pair. The secret half is zeroized on drop.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from its 32-byte private key.
    pub fn from_secret_bytes(mut bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        bytes.zeroize();
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Raw private key. Handle with care.
    fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 Diffie-Hellman with a peer public key.
    ///
    /// An all-zero output means the peer sent a low-order point; it is
    /// rejected rather than used as key material.
    pub fn diffie_hellman(&self, peer_public: &[u8; PUBLIC_KEY_LEN]) -> Result<Zeroizing<[u8; 32]>> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPublicKey);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

/// Public key for a given 32-byte private key seed.
pub fn public_key_from_seed(seed: [u8; 32]) -> [u8; PUBLIC_KEY_LEN] {
    KeyPair::from_secret_bytes(seed).public_bytes()
}

/// Hex-encoded form of an identity key pair, as written to the secure store.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct SerializableIdentityKeyPair {
    /// Hex of the 32-byte Curve25519 public key.
    pub public_key: String,
    /// Hex of the 32-byte Curve25519 private key.
    pub private_key: String,
}

impl SerializableIdentityKeyPair {
    pub fn from_key_pair(pair: &KeyPair) -> Self {
        Self {
            public_key: hex::encode(pair.public_bytes()),
            private_key: hex::encode(*pair.secret_bytes()),
        }
    }

    /// Rebuild the key pair, rejecting entries whose stored public key does
    /// not match the one derived from the private key.
    pub fn to_key_pair(&self) -> Result<KeyPair> {
        let private = Zeroizing::new(
            hex::decode(&self.private_key)
                .map_err(|e| CryptoError::Storage(format!("private key is not hex: {e}")))?,
        );
        let bytes: [u8; 32] = private.as_slice().try_into().map_err(|_| {
            CryptoError::Storage(format!(
                "private key has {} bytes, expected 32",
                private.len()
            ))
        })?;
        let pair = KeyPair::from_secret_bytes(bytes);
        if hex::encode(pair.public_bytes()) != self.public_key.to_ascii_lowercase() {
            return Err(CryptoError::Storage(
                "stored public key does not match private key".into(),
            ));
        }
        Ok(pair)
    }

    pub fn to_json(&self) -> Result<Zeroizing<String>> {
        serde_json::to_string(self)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::Storage(format!("serialization failed: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CryptoError::Storage(format!("deserialization failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generate_and_roundtrip() {
        let pair = KeyPair::generate();
        let serializable = SerializableIdentityKeyPair::from_key_pair(&pair);
        let restored = serializable.to_key_pair().unwrap();
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn stored_form_is_hex_json() {
        let pair = KeyPair::from_secret_bytes([3; 32]);
        let json = SerializableIdentityKeyPair::from_key_pair(&pair).to_json().unwrap();
        assert!(json.contains("\"publicKey\""));
        assert!(json.contains(&"03".repeat(32)));
    }

    #[test]
    fn mismatched_public_key_is_corrupt() {
        let pair = KeyPair::generate();
        let mut stored = SerializableIdentityKeyPair::from_key_pair(&pair);
        stored.public_key = hex::encode([0u8; 32]);
        assert!(matches!(stored.to_key_pair(), Err(CryptoError::Storage(_))));
    }

    #[test]
    fn truncated_private_key_is_corrupt() {
        let stored = SerializableIdentityKeyPair {
            public_key: String::new(),
            private_key: "abcd".into(),
        };
        assert!(matches!(stored.to_key_pair(), Err(CryptoError::Storage(_))));
    }

    #[test]
    fn key_exchange_agrees() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ab = alice.diffie_hellman(&bob.public_bytes()).unwrap();
        let ba = bob.diffie_hellman(&alice.public_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn low_order_point_rejected() {
        let pair = KeyPair::generate();
        assert!(matches!(
            pair.diffie_hellman(&[0u8; 32]),
            Err(CryptoError::LowOrderPublicKey)
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let pair = KeyPair::from_secret_bytes([0xAB; 32]);
        let debug = format!("{pair:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(&"ab".repeat(32)));
    }

    proptest! {
        #[test]
        fn public_key_is_deterministic(seed in any::<[u8; 32]>()) {
            let first = public_key_from_seed(seed);
            let second = public_key_from_seed(seed);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first.len(), 32);
        }
    }
}
