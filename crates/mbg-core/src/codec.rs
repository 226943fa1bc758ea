//! Length-prefixed CBOR framing for the mTLS data-plane preamble.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`
//!
//! Only the endpoint hello/ack exchange is framed; once it completes the
//! stream carries raw application bytes, so readers take the header and
//! payload exactly and never buffer past the frame.

use crate::error::{MbgError, MbgResult};
use std::io::Cursor;

/// Upper bound on a preamble frame payload (64 KiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> MbgResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(MbgError::Codec(format!(
            "frame too large: {} bytes (max {})",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> MbgResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Parse a frame header and validate the announced payload length.
pub fn frame_len(header: [u8; 4]) -> MbgResult<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(MbgError::Codec(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_LEN})"
        )));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{EndpointAck, EndpointHello};

    fn split(frame: &[u8]) -> ([u8; 4], &[u8]) {
        ([frame[0], frame[1], frame[2], frame[3]], &frame[4..])
    }

    #[test]
    fn hello_frame_layout() {
        let hello = EndpointHello {
            endpoint: "a:b-0001".into(),
        };
        let frame = frame_encode(&hello).unwrap();
        let (header, payload) = split(&frame);
        assert_eq!(frame_len(header).unwrap(), payload.len());
        let decoded: EndpointHello = cbor_decode(payload).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn ack_with_reason() {
        let ack = EndpointAck {
            accepted: false,
            reason: Some("unknown endpoint".into()),
        };
        let frame = frame_encode(&ack).unwrap();
        let decoded: EndpointAck = cbor_decode(&frame[4..]).unwrap();
        assert!(!decoded.accepted);
        assert_eq!(decoded.reason.as_deref(), Some("unknown endpoint"));
    }

    #[test]
    fn oversized_header_rejected() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(frame_len(header).is_err());
    }

    #[test]
    fn garbage_payload_is_codec_error() {
        let err = cbor_decode::<EndpointHello>(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, MbgError::Codec(_)));
    }
}
