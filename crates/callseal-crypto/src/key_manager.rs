//! Custody of the device's key material.
//!
//! The key manager owns the long-term identity key pair (persisted through a
//! [`SecureStore`]) and a short-lived ephemeral key pair that is replaced once
//! it outlives the configured TTL. Private keys never leave this module; the
//! rest of the crate only sees public keys and Diffie-Hellman outputs.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use callseal_protocol::{KeyBundle, PUBLIC_KEY_LEN};

use crate::config::CryptoConfig;
use crate::error::{CryptoError, Result};
use crate::identity::{KeyPair, SerializableIdentityKeyPair};
use crate::storage::SecureStore;

/// Where the identity key pair came from during the last `initialize()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// Read back from the secure store.
    Loaded,
    /// Nothing was stored; a fresh key pair was generated.
    Generated,
    /// The stored entry was unreadable or corrupt and got replaced.
    Regenerated,
}

/// Outcome of [`KeyManager::initialize`].
#[derive(Debug, Clone)]
pub struct InitReport {
    pub identity: IdentitySource,
    /// Set when the identity key pair could not be written to the secure
    /// store. The keys work for this run but may not survive a restart.
    pub persistence_warning: Option<String>,
}

struct EphemeralKey {
    pair: KeyPair,
    created_at: Instant,
}

impl EphemeralKey {
    fn generate() -> Self {
        Self {
            pair: KeyPair::generate(),
            created_at: Instant::now(),
        }
    }
}

struct KeyState {
    identity: KeyPair,
    ephemeral: EphemeralKey,
}

pub struct KeyManager {
    store: Arc<dyn SecureStore>,
    config: CryptoConfig,
    state: RwLock<Option<KeyState>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn SecureStore>, config: CryptoConfig) -> Self {
        Self {
            store,
            config,
            state: RwLock::new(None),
        }
    }

    /// Load or create the identity key pair, then generate an ephemeral one.
    ///
    /// Never fails: an unreadable store entry is replaced by a new identity,
    /// and a failed write is reported through [`InitReport::persistence_warning`].
    /// Calling it again re-reads the persisted identity.
    pub async fn initialize(&self) -> InitReport {
        let (identity, source) = match self.load_identity().await {
            Ok(Some(pair)) => {
                debug!("loaded identity key from secure store");
                (pair, IdentitySource::Loaded)
            }
            Ok(None) => (KeyPair::generate(), IdentitySource::Generated),
            Err(e) => {
                warn!("stored identity key unusable, generating a new one: {e}");
                (KeyPair::generate(), IdentitySource::Regenerated)
            }
        };

        let mut persistence_warning = None;
        if source != IdentitySource::Loaded {
            info!(public_key = %hex::encode(identity.public_bytes()), "generated identity key");
            if let Err(e) = self.store_identity(&identity).await {
                warn!("failed to persist identity key, keys may not persist across restarts: {e}");
                persistence_warning = Some(format!("keys may not persist across restarts: {e}"));
            }
        }

        *self.write_state() = Some(KeyState {
            identity,
            ephemeral: EphemeralKey::generate(),
        });

        InitReport {
            identity: source,
            persistence_warning,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.read_state().is_some()
    }

    /// Replace the ephemeral key pair if it has outlived the TTL.
    /// Returns whether a rotation happened.
    pub fn rotate_ephemeral_key_if_needed(&self) -> Result<bool> {
        let mut guard = self.write_state();
        let state = guard.as_mut().ok_or(CryptoError::IdentityKeyNotInitialized)?;
        if state.ephemeral.created_at.elapsed() <= self.config.ephemeral_ttl() {
            return Ok(false);
        }
        state.ephemeral = EphemeralKey::generate();
        info!(
            public_key = %hex::encode(state.ephemeral.pair.public_bytes()),
            "rotated ephemeral key"
        );
        Ok(true)
    }

    /// Time since the current ephemeral key pair was generated.
    pub fn ephemeral_key_age(&self) -> Result<Duration> {
        self.with_state(|state| state.ephemeral.created_at.elapsed())
    }

    pub fn get_identity_public_key(&self) -> Result<[u8; PUBLIC_KEY_LEN]> {
        self.with_state(|state| state.identity.public_bytes())
    }

    pub fn get_ephemeral_public_key(&self) -> Result<[u8; PUBLIC_KEY_LEN]> {
        self.with_state(|state| state.ephemeral.pair.public_bytes())
    }

    /// Build the bundle handed to signaling. At least one identifier is
    /// required so the receiving side knows whom the bundle belongs to.
    pub fn create_key_bundle(
        &self,
        user_id: Option<&str>,
        peer_id: Option<&str>,
    ) -> Result<KeyBundle> {
        let (identity, ephemeral) = self.with_state(|state| {
            (
                state.identity.public_bytes(),
                state.ephemeral.pair.public_bytes(),
            )
        })?;
        if user_id.is_none() && peer_id.is_none() {
            return Err(CryptoError::BundleNotAddressable);
        }
        Ok(KeyBundle::new(
            &identity,
            &ephemeral,
            now_millis(),
            user_id.map(str::to_owned),
            peer_id.map(str::to_owned),
        ))
    }

    /// X25519 between the local identity private key and `peer_public_key`.
    pub fn compute_shared_secret(
        &self,
        peer_public_key: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<Zeroizing<[u8; 32]>> {
        let guard = self.read_state();
        let state = guard.as_ref().ok_or(CryptoError::IdentityKeyNotInitialized)?;
        state.identity.diffie_hellman(peer_public_key)
    }

    /// Forget all key material and delete the persisted identity.
    ///
    /// In-memory state is always cleared; a failing store delete is only logged.
    pub async fn clear_keys(&self) {
        *self.write_state() = None;
        if let Err(e) = self.store.delete(&self.config.identity_storage_key).await {
            warn!("failed to delete stored identity key: {e}");
        }
        info!("cleared key material");
    }

    async fn load_identity(&self) -> Result<Option<KeyPair>> {
        let stored = self
            .store
            .get(&self.config.identity_storage_key)
            .await
            .map_err(|e| CryptoError::Storage(e.to_string()))?;
        let Some(json) = stored.map(Zeroizing::new) else {
            return Ok(None);
        };
        let pair = SerializableIdentityKeyPair::from_json(&json)?.to_key_pair()?;
        Ok(Some(pair))
    }

    async fn store_identity(&self, pair: &KeyPair) -> Result<()> {
        let json = SerializableIdentityKeyPair::from_key_pair(pair).to_json()?;
        self.store
            .set(&self.config.identity_storage_key, &json)
            .await
            .map_err(|e| CryptoError::Storage(e.to_string()))
    }

    fn with_state<T>(&self, f: impl FnOnce(&KeyState) -> T) -> Result<T> {
        self.read_state()
            .as_ref()
            .map(f)
            .ok_or(CryptoError::IdentityKeyNotInitialized)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Option<KeyState>> {
        self.state.read().unwrap_or_else(|p| {
            warn!("key state lock poisoned, recovering");
            p.into_inner()
        })
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<KeyState>> {
        self.state.write().unwrap_or_else(|p| {
            warn!("key state lock poisoned, recovering");
            p.into_inner()
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStore, MemoryStore};

    /// Store whose every operation fails.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl SecureStore for BrokenStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("keystore locked")
        }
        async fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("keystore locked")
        }
        async fn delete(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("keystore locked")
        }
    }

    const DEFAULT_KEY: &str = crate::config::DEFAULT_IDENTITY_STORAGE_KEY;

    fn manager(store: &MemoryStore) -> KeyManager {
        KeyManager::new(Arc::new(store.clone()), CryptoConfig::default())
    }

    #[tokio::test]
    async fn first_run_generates_and_persists_identity() {
        let store = MemoryStore::new();
        let km = manager(&store);
        let report = km.initialize().await;

        assert_eq!(report.identity, IdentitySource::Generated);
        assert!(report.persistence_warning.is_none());
        assert_eq!(km.get_identity_public_key().unwrap().len(), 32);
        assert!(store.get(DEFAULT_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restart_with_same_store_keeps_identity() {
        let store = MemoryStore::new();
        let first = manager(&store);
        first.initialize().await;
        let public = first.get_identity_public_key().unwrap();

        let second = manager(&store);
        let report = second.initialize().await;
        assert_eq!(report.identity, IdentitySource::Loaded);
        assert_eq!(second.get_identity_public_key().unwrap(), public);
    }

    #[tokio::test]
    async fn reinitialize_is_idempotent_for_identity() {
        let store = MemoryStore::new();
        let km = manager(&store);
        km.initialize().await;
        let public = km.get_identity_public_key().unwrap();
        km.initialize().await;
        assert_eq!(km.get_identity_public_key().unwrap(), public);
    }

    #[tokio::test]
    async fn corrupt_entry_is_replaced() {
        let store = MemoryStore::new();
        store.set(DEFAULT_KEY, "{not json").await.unwrap();

        let km = manager(&store);
        let report = km.initialize().await;
        assert_eq!(report.identity, IdentitySource::Regenerated);

        let stored = store.get(DEFAULT_KEY).await.unwrap().unwrap();
        let restored = SerializableIdentityKeyPair::from_json(&stored)
            .unwrap()
            .to_key_pair()
            .unwrap();
        assert_eq!(restored.public_bytes(), km.get_identity_public_key().unwrap());
    }

    #[tokio::test]
    async fn corrupt_key_store_file_is_replaced_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        std::fs::write(&path, b"garbage garbage garbage").unwrap();
        let open = || {
            KeyManager::new(
                Arc::new(FileStore::new(&path, "pw").with_iterations(1)),
                CryptoConfig::default(),
            )
        };

        let first = open();
        let report = first.initialize().await;
        assert_eq!(report.identity, IdentitySource::Regenerated);
        assert!(report.persistence_warning.is_none());
        let identity = first.get_identity_public_key().unwrap();

        let restarted = open();
        let report = restarted.initialize().await;
        assert_eq!(report.identity, IdentitySource::Loaded);
        assert_eq!(restarted.get_identity_public_key().unwrap(), identity);
        assert!(dir.path().join("keys.bin.corrupt").exists());
    }

    #[tokio::test]
    async fn broken_store_still_initializes_with_warning() {
        let km = KeyManager::new(Arc::new(BrokenStore), CryptoConfig::default());
        let report = km.initialize().await;
        assert_eq!(report.identity, IdentitySource::Regenerated);
        assert!(report
            .persistence_warning
            .unwrap()
            .contains("may not persist"));
        assert!(km.is_initialized());
    }

    #[test]
    fn accessors_fail_before_initialize() {
        let km = manager(&MemoryStore::new());
        for err in [
            km.get_identity_public_key().unwrap_err(),
            km.get_ephemeral_public_key().unwrap_err(),
            km.compute_shared_secret(&[9; 32]).unwrap_err(),
            km.create_key_bundle(Some("u"), None).unwrap_err(),
            km.rotate_ephemeral_key_if_needed().unwrap_err(),
        ] {
            assert_eq!(err.code(), "identity_key_not_initialized");
        }
    }

    #[tokio::test]
    async fn bundle_requires_an_identifier() {
        let km = manager(&MemoryStore::new());
        km.initialize().await;
        assert!(matches!(
            km.create_key_bundle(None, None),
            Err(CryptoError::BundleNotAddressable)
        ));

        let bundle = km.create_key_bundle(Some("alice"), None).unwrap();
        assert_eq!(bundle.user_id.as_deref(), Some("alice"));
        assert_eq!(
            bundle.identity_key_bytes().unwrap(),
            km.get_identity_public_key().unwrap()
        );
        assert_eq!(
            bundle.ephemeral_key_bytes().unwrap(),
            km.get_ephemeral_public_key().unwrap()
        );
        assert!(bundle.timestamp > 0);
    }

    #[tokio::test]
    async fn ephemeral_differs_from_identity() {
        let km = manager(&MemoryStore::new());
        km.initialize().await;
        assert_ne!(
            km.get_identity_public_key().unwrap(),
            km.get_ephemeral_public_key().unwrap()
        );
    }

    #[tokio::test]
    async fn fresh_ephemeral_key_is_not_rotated() {
        let km = manager(&MemoryStore::new());
        km.initialize().await;
        let before = km.get_ephemeral_public_key().unwrap();
        assert!(!km.rotate_ephemeral_key_if_needed().unwrap());
        assert_eq!(km.get_ephemeral_public_key().unwrap(), before);
    }

    #[tokio::test]
    async fn expired_ephemeral_key_is_rotated() {
        let config = CryptoConfig {
            ephemeral_ttl_secs: 0,
            ..CryptoConfig::default()
        };
        let km = KeyManager::new(Arc::new(MemoryStore::new()), config);
        km.initialize().await;
        let identity = km.get_identity_public_key().unwrap();
        let before = km.get_ephemeral_public_key().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(km.rotate_ephemeral_key_if_needed().unwrap());
        assert_ne!(km.get_ephemeral_public_key().unwrap(), before);
        assert!(km.ephemeral_key_age().unwrap() < Duration::from_secs(1));
        // Identity is never rotated.
        assert_eq!(km.get_identity_public_key().unwrap(), identity);
    }

    #[tokio::test]
    async fn two_devices_derive_equal_secrets() {
        let a = manager(&MemoryStore::new());
        let b = manager(&MemoryStore::new());
        a.initialize().await;
        b.initialize().await;

        let ab = a
            .compute_shared_secret(&b.get_identity_public_key().unwrap())
            .unwrap();
        let ba = b
            .compute_shared_secret(&a.get_identity_public_key().unwrap())
            .unwrap();
        assert_eq!(*ab, *ba);
    }

    #[tokio::test]
    async fn clear_keys_wipes_memory_and_store() {
        let store = MemoryStore::new();
        let km = manager(&store);
        km.initialize().await;
        let old = km.get_identity_public_key().unwrap();

        km.clear_keys().await;
        assert!(!km.is_initialized());
        assert!(store.is_empty());

        let report = km.initialize().await;
        assert_eq!(report.identity, IdentitySource::Generated);
        assert_ne!(km.get_identity_public_key().unwrap(), old);
    }

    #[tokio::test]
    async fn clear_keys_swallows_store_errors() {
        let km = KeyManager::new(Arc::new(BrokenStore), CryptoConfig::default());
        km.initialize().await;
        km.clear_keys().await;
        assert!(!km.is_initialized());
    }
}
