//! Human-comparable security codes.
//!
//! Both call participants read their code aloud (or compare it on screen);
//! matching codes mean neither side talked to a key substituted in transit.
//! The two identity keys are sorted before hashing so the result does not
//! depend on which side is local.

use sha2::{Digest, Sha256};

use callseal_protocol::PUBLIC_KEY_LEN;

const CODE_DOMAIN: &[u8] = b"callseal-security-code-v1";

/// Number of five-digit groups in a code.
pub const CODE_GROUPS: usize = 6;

/// Compute the security code for a pair of identity public keys.
///
/// Output is 30 decimal digits in six space-separated groups of five, e.g.
/// `"04817 55210 90034 12876 66109 30451"`.
pub fn security_code(
    local_identity: &[u8; PUBLIC_KEY_LEN],
    peer_identity: &[u8; PUBLIC_KEY_LEN],
) -> String {
    let (first, second) = if local_identity <= peer_identity {
        (local_identity, peer_identity)
    } else {
        (peer_identity, local_identity)
    };

    let digest = Sha256::new()
        .chain_update(CODE_DOMAIN)
        .chain_update(first)
        .chain_update(second)
        .finalize();

    // Each group consumes 5 digest bytes (40 bits), reduced mod 100000.
    digest
        .chunks_exact(5)
        .take(CODE_GROUPS)
        .map(|chunk| {
            let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            format!("{:05}", value % 100_000)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_order_independent() {
        let a = [0x01; 32];
        let b = [0xFE; 32];
        assert_eq!(security_code(&a, &b), security_code(&b, &a));
    }

    #[test]
    fn code_shape() {
        let code = security_code(&[5; 32], &[6; 32]);
        let groups: Vec<&str> = code.split(' ').collect();
        assert_eq!(groups.len(), CODE_GROUPS);
        assert!(groups
            .iter()
            .all(|g| g.len() == 5 && g.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn different_keys_give_different_codes() {
        let a = [1; 32];
        assert_ne!(security_code(&a, &[2; 32]), security_code(&a, &[3; 32]));
    }

    #[test]
    fn code_is_deterministic() {
        assert_eq!(
            security_code(&[7; 32], &[8; 32]),
            security_code(&[7; 32], &[8; 32])
        );
    }
}
