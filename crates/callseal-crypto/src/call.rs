//! Wiring of the three components for one call.

use std::sync::Arc;

use tracing::info;

use crate::config::CryptoConfig;
use crate::frame::FrameEncryptor;
use crate::key_manager::KeyManager;
use crate::session::SessionManager;
use crate::storage::SecureStore;

/// Key manager, session manager and frame encryptor built over one secure
/// store and one configuration. Owned by the host for the lifetime of a call.
pub struct CallCrypto {
    pub keys: Arc<KeyManager>,
    pub sessions: Arc<SessionManager>,
    pub frames: FrameEncryptor,
}

impl CallCrypto {
    pub fn new(store: Arc<dyn SecureStore>, config: CryptoConfig) -> Self {
        let keys = Arc::new(KeyManager::new(store, config.clone()));
        let sessions = Arc::new(SessionManager::new(keys.clone()));
        let frames = FrameEncryptor::new(sessions.clone(), &config);
        Self {
            keys,
            sessions,
            frames,
        }
    }

    /// End of call: stop transforming frames and drop all per-peer state.
    /// Key material is kept for the next call.
    pub fn teardown(&self) {
        self.frames.set_enabled(false);
        self.frames.clear_all_counters();
        self.sessions.close_all_sessions();
        info!("call crypto torn down");
    }
}
