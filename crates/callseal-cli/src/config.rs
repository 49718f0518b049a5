use callseal_crypto::CryptoConfig;
use serde::Deserialize;

/// CLI configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Path to the encrypted key store file.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Environment variable holding the key store password.
    #[serde(default = "default_password_env")]
    pub store_password_env: String,

    /// PBKDF2 iterations for the key store (default 600000).
    #[serde(default)]
    pub pbkdf2_iterations: Option<u32>,

    /// Media encryption tunables.
    #[serde(default)]
    pub crypto: CryptoConfig,
}

fn default_store_path() -> String {
    "callseal_keys.bin".into()
}

fn default_password_env() -> String {
    "CALLSEAL_STORE_PASSWORD".into()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            store_password_env: default_password_env(),
            pbkdf2_iterations: None,
            crypto: CryptoConfig::default(),
        }
    }
}
