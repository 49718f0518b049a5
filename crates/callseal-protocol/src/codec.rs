use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::types::KeyBundle;

/// Maximum encoded bundle size: 4 KiB.
pub const MAX_MSG_SIZE: u32 = 4096;

/// Encode a `KeyBundle` into a length-prefixed byte buffer for binary signaling channels.
pub fn encode_bundle(bundle: &KeyBundle) -> Result<Vec<u8>, ProtocolError> {
    let payload = postcard::to_allocvec(bundle)?;
    if payload.len() > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a `KeyBundle` from a postcard-encoded payload (without length prefix).
pub fn decode_bundle(payload: &[u8]) -> Result<KeyBundle, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Serialize a bundle as JSON for text signaling channels.
pub fn bundle_to_json(bundle: &KeyBundle) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(bundle)?)
}

/// Parse a bundle received over a text signaling channel and validate it.
pub fn bundle_from_json(json: &str) -> Result<KeyBundle, ProtocolError> {
    let bundle: KeyBundle = serde_json::from_str(json)?;
    bundle.validate()?;
    tracing::trace!(address = ?bundle.address(), "decoded key bundle");
    Ok(bundle)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the message is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(length));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> KeyBundle {
        KeyBundle::new(&[7; 32], &[9; 32], 42, None, Some("bob".into()))
    }

    #[test]
    fn binary_bundle_survives_framing() {
        let encoded = encode_bundle(&bundle()).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        let decoded = decode_bundle(&payload).unwrap();
        assert_eq!(decoded, bundle());
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let encoded = encode_bundle(&bundle()).unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
        // Nothing consumed while incomplete.
        assert_eq!(buf.len(), encoded.len() - 1);
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut data = encode_bundle(&bundle()).unwrap();
        data.extend(encode_bundle(&bundle()).unwrap());
        let mut buf = BytesMut::from(&data[..]);
        assert!(try_decode_frame(&mut buf).unwrap().is_some());
        assert!(try_decode_frame(&mut buf).unwrap().is_some());
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_MSG_SIZE + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn json_bundle_is_validated() {
        let json = bundle_to_json(&bundle()).unwrap();
        assert_eq!(bundle_from_json(&json).unwrap(), bundle());

        let mut unaddressed = bundle();
        unaddressed.peer_id = None;
        let json = bundle_to_json(&unaddressed).unwrap();
        assert!(matches!(
            bundle_from_json(&json),
            Err(ProtocolError::NotAddressable)
        ));
    }
}
