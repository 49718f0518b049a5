//! Errors raised by the key and session layers.
//!
//! The frame path never returns these to its caller; it logs them and applies
//! the configured failure policy instead.

use callseal_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("identity key not initialized")]
    IdentityKeyNotInitialized,

    #[error("session not found for peer {0}")]
    SessionNotFound(String),

    #[error("key bundle needs a user id or a peer id")]
    BundleNotAddressable,

    #[error("invalid peer public key: {0}")]
    InvalidPublicKey(#[from] ProtocolError),

    #[error("peer public key is a low-order point")]
    LowOrderPublicKey,

    #[error("secure storage error: {0}")]
    Storage(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: invalid key, nonce or tampered data")]
    DecryptionFailed,

    #[error("frame counter {0} reached the rotation ceiling, session must be renegotiated")]
    CounterExhausted(u32),

    #[error("key derivation failed")]
    KeyDerivationFailed,
}

impl CryptoError {
    /// Stable machine-readable name for host applications.
    pub fn code(&self) -> &'static str {
        match self {
            Self::IdentityKeyNotInitialized => "identity_key_not_initialized",
            Self::SessionNotFound(_) => "session_not_found",
            Self::BundleNotAddressable => "bundle_not_addressable",
            Self::InvalidPublicKey(_) => "invalid_public_key",
            Self::LowOrderPublicKey => "low_order_public_key",
            Self::Storage(_) => "storage",
            Self::EncryptionFailed => "encryption_failed",
            Self::DecryptionFailed => "decryption_failed",
            Self::CounterExhausted(_) => "counter_exhausted",
            Self::KeyDerivationFailed => "key_derivation_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_snake_case_names() {
        assert_eq!(
            CryptoError::IdentityKeyNotInitialized.code(),
            "identity_key_not_initialized"
        );
        assert_eq!(
            CryptoError::SessionNotFound("p".into()).code(),
            "session_not_found"
        );
    }

    #[test]
    fn session_not_found_names_peer() {
        let e = CryptoError::SessionNotFound("peer-42".into());
        assert!(e.to_string().contains("peer-42"));
    }

    #[test]
    fn from_protocol_error() {
        let e: CryptoError = ProtocolError::NotAddressable.into();
        assert_eq!(e.code(), "invalid_public_key");
    }
}
