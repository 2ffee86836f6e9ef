//! Wire envelope for a single exchanged object.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! offset  size  field
//! 0       4     total_len     (= 12 + type_name_len + payload_len)
//! 4       4     exchange_code (i32, must match the receiver's code)
//! 8       4     type_name_len
//! 12      N     type_name     (UTF-8 runtime type identifier)
//! 12+N    rest  payload       (UTF-8 serialized object text)
//! ```

use std::any::type_name;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::codec::Codec;
use crate::error::{ExchangeError, Result};

/// Exchange code used when none is configured. Chosen at random.
pub const DEFAULT_EXCHANGE_CODE: i32 = 0x43ef_fa38;

/// Fixed header size: total length, exchange code, type-name length.
pub const HEADER_LEN: usize = 12;

/// Default cap on a single frame. The decoder allocates `total_len` bytes
/// up front, so the cap bounds what a hostile length prefix can demand.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Derive a per-type exchange code from a runtime type identifier.
///
/// CRC32 of the UTF-8 name, truncated to a signed 32-bit value. Distinct
/// types can collide; over 32 bits that risk is accepted in place of any
/// channel negotiation.
pub fn type_code(name: &str) -> i32 {
    crc32fast::hash(name.as_bytes()) as i32
}

/// One complete self-describing frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub exchange_code: i32,
    pub type_name: String,
    /// UTF-8 serialized object text (zero-copy slice when decoded).
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame for an object by serializing it through `codec`.
    ///
    /// The type identifier is `std::any::type_name::<T>()`; both peers
    /// must be built from the same crate for the names to line up.
    pub fn for_object<T: Serialize, C: Codec>(
        value: &T,
        exchange_code: i32,
        codec: &C,
    ) -> Result<Self> {
        let text = codec.encode(value).map_err(ExchangeError::Codec)?;
        Ok(Self {
            exchange_code,
            type_name: type_name::<T>().to_string(),
            payload: Bytes::from(text),
        })
    }

    /// Total frame length on the wire, including the length field itself.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.type_name.len() + self.payload.len()
    }

    /// Encode the frame into a fresh buffer.
    pub fn encode(&self, max_len: usize) -> Result<BytesMut> {
        let total = self.total_len();

        if total > max_len {
            return Err(ExchangeError::FrameTooLarge {
                size: total,
                max: max_len,
            });
        }
        if self.type_name.len() > i32::MAX as usize {
            return Err(ExchangeError::InvalidFrame("type name too long".to_string()));
        }

        let mut buf = BytesMut::with_capacity(total);

        buf.put_u32_le(total as u32);
        buf.put_i32_le(self.exchange_code);
        buf.put_i32_le(self.type_name.len() as i32);
        buf.put_slice(self.type_name.as_bytes());
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decode a complete frame buffer (starting at the length field).
    ///
    /// Validates the length invariant and the type name; the payload is a
    /// zero-copy slice of `raw`. Exchange-code matching is the caller's
    /// concern.
    pub fn decode(raw: &Bytes) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(ExchangeError::InvalidFrame(
                "buffer too small for frame header".to_string(),
            ));
        }

        let mut header = &raw[..HEADER_LEN];

        let total = header.get_u32_le() as usize;
        if total != raw.len() {
            return Err(ExchangeError::InvalidFrame(format!(
                "length field says {} bytes, buffer holds {}",
                total,
                raw.len()
            )));
        }

        let exchange_code = header.get_i32_le();

        let name_len = header.get_i32_le();
        if name_len < 0 || HEADER_LEN + name_len as usize > raw.len() {
            return Err(ExchangeError::InvalidFrame(format!(
                "type name length {} out of bounds",
                name_len
            )));
        }
        let name_end = HEADER_LEN + name_len as usize;

        let type_name = std::str::from_utf8(&raw[HEADER_LEN..name_end])
            .map_err(|e| ExchangeError::InvalidFrame(format!("type name is not UTF-8: {}", e)))?
            .to_string();

        Ok(Self {
            exchange_code,
            type_name,
            payload: raw.slice(name_end..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_frame_layout() {
        let frame = Frame {
            exchange_code: DEFAULT_EXCHANGE_CODE,
            type_name: "demo::Point".to_string(),
            payload: Bytes::from_static(b"{\"x\":1,\"y\":2}"),
        };

        let n = frame.type_name.len();
        let l = frame.payload.len();
        let buf = frame.encode(DEFAULT_MAX_FRAME_LEN).unwrap();

        assert_eq!(buf.len(), 12 + n + l);

        // total_len at offset 0, little-endian
        let total = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(total as usize, 12 + n + l);

        let code = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(code, DEFAULT_EXCHANGE_CODE);

        let name_len = i32::from_le_bytes(buf[8..12].try_into().unwrap());
        assert_eq!(name_len as usize, n);

        assert_eq!(&buf[12..12 + n], frame.type_name.as_bytes());
        assert_eq!(&buf[12 + n..], &frame.payload[..]);
    }

    #[test]
    fn test_round_trip() {
        let codec = JsonCodec;
        let point = Point { x: -3, y: 44 };

        let frame = Frame::for_object(&point, 99, &codec).unwrap();
        let encoded = frame.encode(DEFAULT_MAX_FRAME_LEN).unwrap().freeze();
        let decoded = Frame::decode(&encoded).unwrap();

        assert_eq!(decoded.exchange_code, 99);
        assert_eq!(decoded.type_name, frame.type_name);

        let text = std::str::from_utf8(&decoded.payload).unwrap();
        let back: Point = codec.decode(text).unwrap();
        assert_eq!(back, point);
    }

    #[test]
    fn test_too_large_rejected() {
        let frame = Frame {
            exchange_code: 1,
            type_name: "t".to_string(),
            payload: Bytes::from(vec![b'x'; 64]),
        };

        let result = frame.encode(32);
        assert!(matches!(result, Err(ExchangeError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_length_invariant_enforced() {
        let frame = Frame {
            exchange_code: 1,
            type_name: "t".to_string(),
            payload: Bytes::from_static(b"{}"),
        };
        let mut buf = frame.encode(DEFAULT_MAX_FRAME_LEN).unwrap();

        // Corrupt the length field.
        buf[0] = buf[0].wrapping_add(1);
        let result = Frame::decode(&buf.freeze());
        assert!(matches!(result, Err(ExchangeError::InvalidFrame(_))));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let raw = Bytes::from_static(&[1, 2, 3]);
        assert!(matches!(
            Frame::decode(&raw),
            Err(ExchangeError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_type_code_is_stable_and_distinct() {
        let a = type_code("demo::Ping");
        let b = type_code("demo::Pong");

        assert_eq!(a, type_code("demo::Ping"));
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_ne!(a, DEFAULT_EXCHANGE_CODE);
    }
}
