//! callseal cryptographic core: end-to-end encryption of call media.
//!
//! This crate provides:
//! - Identity and ephemeral key management (X25519) with secure persistence
//! - Pairwise session establishment from exchanged key bundles
//! - Security codes for out-of-band verification
//! - AES-256-GCM encryption of individual audio/video frames
//!
//! Components are built bottom-up: [`KeyManager`] -> [`SessionManager`] ->
//! [`FrameEncryptor`]. [`CallCrypto`] wires all three for one call.

pub mod call;
pub mod config;
pub mod error;
pub mod frame;
pub mod identity;
pub mod key_manager;
pub mod media_keys;
pub mod security_code;
pub mod session;
pub mod storage;

// Re-export key types for convenience
pub use call::CallCrypto;
pub use config::{CounterMode, CryptoConfig, FailurePolicy};
pub use error::CryptoError;
pub use frame::{Direction, Frame, FrameEncryptor, FrameOutcome, FrameStats, SkipReason};
pub use key_manager::{IdentitySource, InitReport, KeyManager};
pub use media_keys::{SessionKey, GCM_TAG_SIZE, MAX_FRAME_COUNTER};
pub use security_code::security_code;
pub use session::{Session, SessionManager};
pub use storage::{FileStore, MemoryStore, SecureStore, StoreError};
