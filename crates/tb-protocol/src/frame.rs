//! Frame header/trailer encoding and decoding
//!
//! Wire format:
//! - magic: 4 bytes (u32, big-endian, always `TBRG`)
//! - payload_length: 4 bytes (u32, big-endian, payload only)
//! - payload: `payload_length` bytes
//! - crc: 2 bytes (CRC-16/CCITT-FALSE over the payload)
//!
//! The length field never counts the magic, the length itself or the CRC.
//! A bad magic, an oversized length or a CRC mismatch is fatal; the stream
//! is not resynchronized.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Frame magic, ASCII `TBRG`
pub const FRAME_MAGIC: u32 = 0x5442_5247;

/// Size of the frame header (magic + length) in bytes
pub const HEADER_SIZE: usize = 8;

/// Size of the CRC trailer in bytes
pub const TRAILER_SIZE: usize = 2;

/// Maximum payload size (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// CRC-16/CCITT-FALSE (polynomial 0x1021, initial value 0xFFFF) over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Frame header carrying the payload length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(FRAME_MAGIC);
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer yet.
    /// Returns Err on a bad magic value or an oversized length; the length
    /// check happens here so oversized payloads are rejected before any
    /// payload byte is buffered.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = src.get_u32();
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic { found: magic });
        }

        let payload_length = src.get_u32();
        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Some(Self { payload_length }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(12345);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0u8; 5][..]);
        let result = FrameHeader::decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u32(4);

        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::BadMagic { found: 0xDEAD_BEEF })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(FRAME_MAGIC);
        buf.put_u32(MAX_PAYLOAD_SIZE as u32 + 1);

        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_max_length_accepted() {
        let mut buf = BytesMut::new();
        buf.put_u32(FRAME_MAGIC);
        buf.put_u32(MAX_PAYLOAD_SIZE as u32);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload_length as usize, MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_crc16_known_vector() {
        // Standard CRC-16/CCITT-FALSE check value
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_crc16_empty() {
        assert_eq!(crc16(b""), 0xFFFF);
    }

    #[test]
    fn test_crc16_detects_corruption() {
        let clean = crc16(b"hello world");
        let corrupt = crc16(b"hello_world");
        assert_ne!(clean, corrupt);
    }
}
