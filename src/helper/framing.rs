//! Length-prefixed JSON framing
//!
//! Each frame is a u32 little-endian byte length followed by a UTF-8 JSON
//! payload — the Chrome Native Messaging contract. The codec is transport
//! agnostic; anything implementing `AsyncRead`/`AsyncWrite` can carry it.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX_BYTES: usize = 4;

/// Codec for the helper channel.
#[derive(Debug, Clone)]
pub struct HelperCodec {
    max_frame_bytes: usize,
}

impl HelperCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for HelperCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, io::Error> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_le_bytes(length_bytes) as usize;

        if length > self.max_frame_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {length} bytes exceeds cap of {}", self.max_frame_bytes),
            ));
        }

        if src.len() < LENGTH_PREFIX_BYTES + length {
            src.reserve(LENGTH_PREFIX_BYTES + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_BYTES);
        let body = src.split_to(length);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<'a> Encoder<&'a Value> for HelperCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &'a Value, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(item)?;
        if body.len() > self.max_frame_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds cap of {}", body.len(), self.max_frame_bytes),
            ));
        }
        dst.reserve(LENGTH_PREFIX_BYTES + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let mut codec = HelperCodec::new(1024);
        let mut buffer = BytesMut::new();
        let frame = json!({"id": 1, "command": "heartbeat"});

        codec.encode(&frame, &mut buffer).unwrap();
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let mut codec = HelperCodec::new(1024);
        let mut wire = BytesMut::new();
        let frame = json!({"id": 2, "alive": true});
        codec.encode(&frame, &mut wire).unwrap();

        // Feed the bytes one at a time; the decoder must wait for the
        // complete frame.
        let mut buffer = BytesMut::new();
        let mut decoded = None;
        for byte in wire.iter() {
            buffer.put_u8(*byte);
            if let Some(value) = codec.decode(&mut buffer).unwrap() {
                decoded = Some(value);
            }
        }
        assert_eq!(decoded.unwrap(), frame);
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = HelperCodec::new(1024);
        let mut buffer = BytesMut::new();
        codec.encode(&json!({"id": 1}), &mut buffer).unwrap();
        codec.encode(&json!({"id": 2}), &mut buffer).unwrap();

        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap()["id"], 1);
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap()["id"], 2);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = HelperCodec::new(16);
        let mut buffer = BytesMut::new();
        buffer.put_u32_le(1_000_000);
        buffer.put_slice(b"xxxx");
        assert!(codec.decode(&mut buffer).is_err());

        let big = json!({"data": "x".repeat(64)});
        let mut out = BytesMut::new();
        assert!(codec.encode(&big, &mut out).is_err());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let mut codec = HelperCodec::new(1024);
        let mut buffer = BytesMut::new();
        buffer.put_u32_le(3);
        buffer.put_slice(b"{{{");
        assert!(codec.decode(&mut buffer).is_err());
    }
}
