use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the frame path does with a frame it cannot transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Forward the frame unmodified. Keeps the call alive at the cost of
    /// sending or playing media in clear.
    #[default]
    FailOpen,
    /// Empty the frame payload so nothing unprotected leaves or gets played.
    FailClosed,
}

/// How frame counters are shared between the send and receive directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterMode {
    /// One counter per peer advanced by both encrypt and decrypt. Matches
    /// peers that expect the combined counter; nonce separation between the
    /// two directions then rests on timestamp/ssrc differing.
    #[default]
    Shared,
    /// Separate send and receive counters per peer.
    PerDirection,
}

/// Tunables for the media encryption core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Age after which the ephemeral key pair is replaced.
    pub ephemeral_ttl_secs: u64,
    pub failure_policy: FailurePolicy,
    pub counter_mode: CounterMode,
    /// Secure-store key under which the identity key pair is persisted.
    pub identity_storage_key: String,
}

/// 24 hours.
pub const DEFAULT_EPHEMERAL_TTL_SECS: u64 = 24 * 60 * 60;

pub const DEFAULT_IDENTITY_STORAGE_KEY: &str = "callseal.identity_keypair";

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            ephemeral_ttl_secs: DEFAULT_EPHEMERAL_TTL_SECS,
            failure_policy: FailurePolicy::default(),
            counter_mode: CounterMode::default(),
            identity_storage_key: DEFAULT_IDENTITY_STORAGE_KEY.into(),
        }
    }
}

impl CryptoConfig {
    pub fn ephemeral_ttl(&self) -> Duration {
        Duration::from_secs(self.ephemeral_ttl_secs)
    }
}
