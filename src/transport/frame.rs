//! Framing codec for batched bridge reads.
//!
//! A batch body is a concatenation of `[u32 little-endian length][payload]`
//! records with no padding, terminated implicitly by the body length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::transport::error::{TransportError, TransportResult};

/// Encodes messages into a single batch body.
pub fn encode_frames(messages: &[Bytes]) -> Bytes {
    let total: usize = messages.iter().map(|m| 4 + m.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for message in messages {
        buf.put_u32_le(message.len() as u32);
        buf.put_slice(message);
    }
    buf.freeze()
}

/// Decodes a batch body into its framed messages.
///
/// A record whose declared length exceeds the remaining body is corruption,
/// not a short read: batches are delivered whole by the bridge.
pub fn decode_frames(body: &[u8]) -> TransportResult<Vec<Bytes>> {
    let mut cursor = body;
    let mut messages = Vec::new();
    while cursor.has_remaining() {
        if cursor.remaining() < 4 {
            return Err(TransportError::corrupt("truncated frame header"));
        }
        let length = cursor.get_u32_le() as usize;
        if cursor.remaining() < length {
            return Err(TransportError::corrupt(format!(
                "frame declares {length} bytes but only {} remain",
                cursor.remaining()
            )));
        }
        messages.push(Bytes::copy_from_slice(&cursor[..length]));
        cursor.advance(length);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_decodes_to_no_messages() {
        assert!(decode_frames(&[]).unwrap().is_empty());
    }

    #[test]
    fn decodes_concatenated_records() {
        let body = encode_frames(&[
            Bytes::from_static(b"first"),
            Bytes::from_static(b""),
            Bytes::from_static(b"third message"),
        ]);
        let messages = decode_frames(&body).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(&messages[0][..], b"first");
        assert!(messages[1].is_empty());
        assert_eq!(&messages[2][..], b"third message");
    }

    #[test]
    fn rejects_truncated_header() {
        let err = decode_frames(&[0x05, 0x00]).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejects_frame_longer_than_body() {
        // Declares 16 bytes, delivers 3.
        let mut body = vec![16, 0, 0, 0];
        body.extend_from_slice(b"abc");
        let err = decode_frames(&body).unwrap_err();
        assert_eq!(err.status, 500);
        assert!(!err.is_retryable());
    }
}
