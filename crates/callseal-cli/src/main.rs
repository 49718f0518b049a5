use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use callseal_crypto::{CallCrypto, FileStore, IdentitySource};
use callseal_protocol::codec::{bundle_from_json, bundle_to_json};

mod config;
mod loopback;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "callseal", about = "End-to-end media encryption toolkit")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the encrypted key store, overrides config
    #[arg(long)]
    store: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load or create the device identity and print its public key
    Identity,
    /// Print a key bundle (JSON) for the signaling layer
    Bundle {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        peer_id: Option<String>,
    },
    /// Establish a session from a peer's bundle file and print the security code
    Code {
        /// JSON key bundle received from the peer
        #[arg(long)]
        peer_bundle: PathBuf,
    },
    /// Delete the stored identity
    Reset,
    /// Simulate a call between two in-memory devices
    Loopback {
        #[arg(long, default_value_t = 100)]
        frames: u32,
        #[arg(long, default_value_t = 160)]
        frame_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callseal=info,callseal_crypto=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        CliConfig::default()
    };

    if let Some(store) = args.store {
        config.store_path = store;
    }

    match args.command {
        Command::Loopback { frames, frame_size } => {
            let report = loopback::run(config.crypto, frames, frame_size).await?;
            println!("security code: {}", report.security_code);
            println!("frames: {}/{} round-tripped", report.frames_matched, report.frames_sent);
            println!("sender:   {:?}", report.sender);
            println!("receiver: {:?}", report.receiver);
            if report.frames_matched != report.frames_sent {
                bail!("{} frames failed to round-trip", report.frames_sent - report.frames_matched);
            }
        }
        command => run_with_store(&config, command).await?,
    }

    Ok(())
}

async fn run_with_store(config: &CliConfig, command: Command) -> Result<()> {
    let password = std::env::var(&config.store_password_env).with_context(|| {
        format!("key store password not set (export {})", config.store_password_env)
    })?;
    let mut store = FileStore::new(&config.store_path, password);
    if let Some(iterations) = config.pbkdf2_iterations {
        store = store.with_iterations(iterations);
    }
    info!(path = %config.store_path, "using key store");

    let call = CallCrypto::new(Arc::new(store), config.crypto.clone());

    if let Command::Reset = command {
        call.keys.clear_keys().await;
        println!("identity cleared");
        return Ok(());
    }

    let report = call.keys.initialize().await;
    if let Some(warning) = &report.persistence_warning {
        warn!("identity not persisted: {warning}");
    }
    match report.identity {
        IdentitySource::Loaded => info!("loaded identity from key store"),
        IdentitySource::Generated => info!("generated new identity"),
        IdentitySource::Regenerated => warn!("stored identity was unreadable and has been replaced"),
    }

    match command {
        Command::Identity => {
            println!("{}", hex::encode(call.keys.get_identity_public_key()?));
        }
        Command::Bundle { user_id, peer_id } => {
            let bundle = call
                .keys
                .create_key_bundle(user_id.as_deref(), peer_id.as_deref())?;
            println!("{}", bundle_to_json(&bundle)?);
        }
        Command::Code { peer_bundle } => {
            let json = fs::read_to_string(&peer_bundle)
                .with_context(|| format!("failed to read bundle: {}", peer_bundle.display()))?;
            let bundle = bundle_from_json(&json)?;
            let peer = bundle
                .address()
                .context("peer bundle carries neither user id nor peer id")?
                .to_string();
            call.sessions.establish_session(&peer, &bundle).await?;
            let code = call
                .sessions
                .get_security_code(&peer)
                .context("session established without a security code")?;
            println!("{peer}: {code}");
            call.teardown();
        }
        // Handled before the store is opened.
        Command::Reset | Command::Loopback { .. } => {}
    }

    Ok(())
}
