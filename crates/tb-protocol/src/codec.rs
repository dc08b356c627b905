//! Tokio codec for framed payloads
//!
//! The codec moves raw payload bytes rather than decoded messages: a
//! connection switches from plaintext handshake payloads to AEAD-sealed
//! payloads once authenticated, so serialization and sealing live above
//! the framing layer (see `channel`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{crc16, FrameHeader, MAX_PAYLOAD_SIZE, TRAILER_SIZE};

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Try to decode the header if we don't have one
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None), // Need more data
            },
        };

        // Wait until payload and CRC trailer are both buffered
        let payload_len = header.payload_length as usize;
        if src.len() < payload_len + TRAILER_SIZE {
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        let expected = src.get_u16();
        let actual = crc16(&payload);
        if actual != expected {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }

        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(payload.len() as u32).encode(dst);
        dst.extend_from_slice(&payload);
        dst.put_u16(crc16(&payload));

        Ok(())
    }
}
