//! In-process call between two simulated devices.
//!
//! Both sides get an in-memory key store, exchange bundles over a
//! length-prefixed byte channel, establish sessions and push random frames
//! from one side to the other.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use rand::RngCore;
use tracing::{info, warn};

use callseal_crypto::{CallCrypto, CryptoConfig, Frame, FrameOutcome, FrameStats, MemoryStore};
use callseal_protocol::codec::{decode_bundle, encode_bundle, try_decode_frame};
use callseal_protocol::KeyBundle;

const CALLER: &str = "caller";
const CALLEE: &str = "callee";
const SSRC: u32 = 0x1234_5678;
/// 20 ms audio frames.
const FRAME_INTERVAL_MICROS: u64 = 20_000;

#[derive(Debug)]
pub struct LoopbackReport {
    pub security_code: String,
    pub frames_sent: u32,
    pub frames_matched: u32,
    pub sender: FrameStats,
    pub receiver: FrameStats,
}

pub async fn run(config: CryptoConfig, frames: u32, frame_size: usize) -> Result<LoopbackReport> {
    let caller = CallCrypto::new(Arc::new(MemoryStore::new()), config.clone());
    let callee = CallCrypto::new(Arc::new(MemoryStore::new()), config);
    caller.keys.initialize().await;
    callee.keys.initialize().await;

    // Signaling: each side sends its bundle down a byte channel.
    let mut channel = BytesMut::new();
    channel.extend_from_slice(&encode_bundle(&caller.keys.create_key_bundle(None, Some(CALLER))?)?);
    channel.extend_from_slice(&encode_bundle(&callee.keys.create_key_bundle(None, Some(CALLEE))?)?);
    let caller_bundle = next_bundle(&mut channel)?;
    let callee_bundle = next_bundle(&mut channel)?;

    caller.sessions.establish_session(CALLEE, &callee_bundle).await?;
    callee.sessions.establish_session(CALLER, &caller_bundle).await?;

    let code = caller
        .sessions
        .get_security_code(CALLEE)
        .context("caller has no security code")?;
    if callee.sessions.get_security_code(CALLER).as_deref() != Some(code.as_str()) {
        bail!("security codes differ between caller and callee");
    }

    caller.frames.set_enabled(true);
    callee.frames.set_enabled(true);

    let mut rng = rand::thread_rng();
    let mut matched = 0;
    for i in 0..frames {
        let mut original = vec![0u8; frame_size];
        rng.fill_bytes(&mut original);

        let mut frame = Frame::new(original.clone(), u64::from(i) * FRAME_INTERVAL_MICROS)
            .with_ssrc(SSRC);
        if caller.frames.encrypt_frame(&mut frame, CALLEE) != FrameOutcome::Encrypted {
            warn!(frame = i, "frame left the caller unencrypted");
            continue;
        }
        if callee.frames.decrypt_frame(&mut frame, CALLER) == FrameOutcome::Decrypted
            && frame.payload == original
        {
            matched += 1;
        } else {
            warn!(frame = i, "frame did not survive the round trip");
        }
    }

    let report = LoopbackReport {
        security_code: code,
        frames_sent: frames,
        frames_matched: matched,
        sender: caller.frames.stats(),
        receiver: callee.frames.stats(),
    };
    info!(sent = frames, matched, "loopback finished");

    caller.teardown();
    callee.teardown();
    Ok(report)
}

fn next_bundle(channel: &mut BytesMut) -> Result<KeyBundle> {
    let payload = try_decode_frame(channel)?.context("signaling channel ran dry")?;
    let bundle = decode_bundle(&payload)?;
    bundle.validate()?;
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use callseal_crypto::CounterMode;

    #[tokio::test]
    async fn loopback_shared_counter_round_trips_in_order_frames() {
        let report = run(CryptoConfig::default(), 3, 160).await.unwrap();
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.frames_matched, 3);
        assert_eq!(report.sender.encrypted, 3);
        assert_eq!(report.receiver.decrypted, 3);
        assert_eq!(report.receiver.passed_through, 0);
    }

    #[tokio::test]
    async fn loopback_per_direction_round_trips_every_frame() {
        let config = CryptoConfig {
            counter_mode: CounterMode::PerDirection,
            ..CryptoConfig::default()
        };
        let report = run(config, 50, 960).await.unwrap();
        assert_eq!(report.frames_matched, 50);
        assert_eq!(report.receiver.decrypted, 50);
        assert_eq!(report.security_code.split(' ').count(), 6);
    }

    #[tokio::test]
    async fn loopback_with_no_frames() {
        let report = run(CryptoConfig::default(), 0, 160).await.unwrap();
        assert_eq!(report.frames_matched, 0);
        assert_eq!(report.sender, FrameStats::default());
    }
}
