use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{field} is not valid hex: {source}")]
    InvalidHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("{field} has wrong length: expected {expected} bytes, got {got}")]
    InvalidKeyLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("key bundle carries neither a user id nor a peer id")]
    NotAddressable,

    #[error("message too large: {0} bytes (max 4096)")]
    MessageTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_key_length_display() {
        let e = ProtocolError::InvalidKeyLength {
            field: "identity_key",
            expected: 32,
            got: 31,
        };
        let msg = e.to_string();
        assert!(msg.contains("identity_key"));
        assert!(msg.contains("32"));
        assert!(msg.contains("31"));
    }

    #[test]
    fn invalid_hex_display_names_field() {
        let source = hex::decode("zz").unwrap_err();
        let e = ProtocolError::InvalidHex {
            field: "ephemeral_key",
            source,
        };
        assert!(e.to_string().starts_with("ephemeral_key"));
    }

    #[test]
    fn message_too_large_display() {
        let e = ProtocolError::MessageTooLarge(100000);
        assert!(e.to_string().contains("100000"));
    }
}
