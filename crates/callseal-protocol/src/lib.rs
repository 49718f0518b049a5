//! Wire types shared between the callseal crypto core and the signaling layer.
//!
//! Nothing in here performs cryptography. The crate defines the key bundle
//! exchanged between call participants and the framing used to hand it to
//! whatever transport the host application uses for signaling.

pub mod codec;
pub mod error;
pub mod types;

pub use error::ProtocolError;
pub use types::{KeyBundle, Ssrc, PUBLIC_KEY_LEN};
