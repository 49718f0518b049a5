//! Secure key-value storage for the identity key pair.
//!
//! The key manager only ever talks to the [`SecureStore`] trait, so a host can
//! plug in its platform keystore. Two implementations ship here: an in-memory
//! store for tests and ephemeral devices, and [`FileStore`], which keeps all
//! entries in a single file encrypted with PBKDF2 + AES-256-GCM.
//!
//! File layout: CSKS header (see [`has_valid_header`]) followed by the
//! postcard-encoded entry map sealed with AES-256-GCM (tag appended).

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::warn;
use zeroize::Zeroizing;

/// At-rest-encrypted key-value storage.
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

// ── In-memory store ─────────────────────────────────────────────────────

/// Process-local store. Clones share the same entries, so a test can hand one
/// clone to a key manager and inspect the other.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SecureStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

// ── Encrypted file store ────────────────────────────────────────────────

const MAGIC: &[u8; 4] = b"CSKS"; // "CallSeal Key Store"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN + 4; // 53 bytes
/// Magic and version are authenticated along with the payload.
const AAD: [u8; 5] = [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], VERSION];

/// PBKDF2 iteration count used unless overridden.
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// Why a key store file could not be read or written.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key store I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a key store file (missing CSKS header)")]
    BadHeader,

    #[error("key store truncated: header announces {expected} payload bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("incorrect password or corrupted key store")]
    Unlock,

    #[error("key store payload unreadable: {0}")]
    Payload(#[from] postcard::Error),

    #[error("key store encryption failed")]
    Seal,
}

impl StoreError {
    /// The file is there but its contents cannot be turned back into entries.
    pub fn is_unreadable(&self) -> bool {
        matches!(
            self,
            Self::BadHeader | Self::Truncated { .. } | Self::Unlock | Self::Payload(_)
        )
    }
}

/// Fixed-size prefix of a key store file:
/// `magic(4) || version(1) || salt(32) || nonce(12) || payload_len(4, BE)`.
struct Header {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
}

impl Header {
    fn fresh() -> Result<Self, StoreError> {
        let rng = SystemRandom::new();
        let mut header = Self {
            salt: [0; SALT_LEN],
            nonce: [0; NONCE_LEN],
        };
        rng.fill(&mut header.salt).map_err(|_| StoreError::Seal)?;
        rng.fill(&mut header.nonce).map_err(|_| StoreError::Seal)?;
        Ok(header)
    }

    /// Split `file_data` into its header and the sealed payload it announces.
    fn parse(file_data: &[u8]) -> Result<(Self, &[u8]), StoreError> {
        if !has_valid_header(file_data) {
            return Err(StoreError::BadHeader);
        }
        let (head, body) = file_data.split_at(HEADER_LEN);
        let fields = &head[AAD.len()..];
        let (salt, fields) = fields.split_at(SALT_LEN);
        let (nonce, len) = fields.split_at(NONCE_LEN);

        let expected = u32::from_be_bytes(len.try_into().map_err(|_| StoreError::BadHeader)?) as usize;
        let payload = body.get(..expected).ok_or(StoreError::Truncated {
            expected,
            found: body.len(),
        })?;

        let header = Self {
            salt: salt.try_into().map_err(|_| StoreError::BadHeader)?,
            nonce: nonce.try_into().map_err(|_| StoreError::BadHeader)?,
        };
        Ok((header, payload))
    }

    fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&AAD);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// AES-256-GCM key stretched from the password with PBKDF2-HMAC-SHA256.
    fn key(&self, password: &str, iterations: NonZeroU32) -> Result<LessSafeKey, StoreError> {
        let mut key_bytes = Zeroizing::new([0u8; 32]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            &self.salt,
            password.as_bytes(),
            &mut *key_bytes,
        );
        UnboundKey::new(&AES_256_GCM, &*key_bytes)
            .map(LessSafeKey::new)
            .map_err(|_| StoreError::Unlock)
    }
}

fn seal(
    entries: &HashMap<String, String>,
    password: &str,
    iterations: NonZeroU32,
) -> Result<Vec<u8>, StoreError> {
    let header = Header::fresh()?;
    let mut body = postcard::to_allocvec(entries)?;
    header
        .key(password, iterations)?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(header.nonce), Aad::from(AAD), &mut body)
        .map_err(|_| StoreError::Seal)?;
    Ok(header.encode(&body))
}

fn open(
    file_data: &[u8],
    password: &str,
    iterations: NonZeroU32,
) -> Result<HashMap<String, String>, StoreError> {
    let (header, sealed) = Header::parse(file_data)?;
    let key = header.key(password, iterations)?;
    let mut buf = Zeroizing::new(sealed.to_vec());
    let plaintext = key
        .open_in_place(Nonce::assume_unique_for_key(header.nonce), Aad::from(AAD), buf.as_mut_slice())
        .map_err(|_| StoreError::Unlock)?;
    Ok(postcard::from_bytes(plaintext)?)
}

/// Check if file data starts with a valid CSKS header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && file_data[..AAD.len()] == AAD
}

/// Password-protected store backed by one file on disk.
///
/// Every write re-encrypts the whole entry map under a fresh salt and nonce
/// and replaces the file atomically (write to `.tmp`, then rename). A write
/// over a file that cannot be opened moves it to `<name>.corrupt` and starts
/// from an empty map.
pub struct FileStore {
    path: PathBuf,
    password: Zeroizing<String>,
    iterations: NonZeroU32,
    /// Serializes read-modify-write cycles within this process.
    lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            password: Zeroizing::new(password.into()),
            iterations: NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Override the PBKDF2 iteration count (a zero count is raised to one).
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where an unreadable store file is moved before it gets replaced.
    pub fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    async fn read(&self) -> Result<HashMap<String, String>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => open(&data, &self.password, self.iterations),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Entries to modify and write back.
    async fn read_for_update(&self) -> anyhow::Result<HashMap<String, String>> {
        match self.read().await {
            Err(e) if e.is_unreadable() => {
                let aside = self.corrupt_path();
                tokio::fs::rename(&self.path, &aside)
                    .await
                    .with_context(|| format!("failed to move aside {}", self.path.display()))?;
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    "key store unreadable, starting a new one: {e}"
                );
                Ok(HashMap::new())
            }
            other => Ok(other?),
        }
    }

    async fn write(&self, entries: &HashMap<String, String>) -> anyhow::Result<()> {
        let data = seal(entries, &self.password, self.iterations)?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
                .await
                .context("failed to restrict key store permissions")?;
        }

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SecureStore for FileStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_for_update().await?;
        entries.insert(key.to_string(), value.to_string());
        self.write(&entries).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_for_update().await?;
        if entries.remove(key).is_some() {
            self.write(&entries).await?;
        }
        Ok(())
    }
}
