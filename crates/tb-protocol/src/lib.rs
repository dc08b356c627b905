//! tb-protocol: Wire protocol for the termbridge agent/relay link
//!
//! This crate defines the framed binary format, the message set, the
//! PSK-authenticated handshake and the AEAD session layer used on the TCP
//! connection between agents and the relay.

pub mod error;
pub mod frame;
pub mod message;
pub mod codec;
pub mod crypto;
pub mod handshake;
pub mod channel;

pub use error::ProtocolError;
pub use frame::{FrameHeader, FRAME_MAGIC, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{AuthOutcome, Message, MessageKind, PtyInfo};
pub use codec::FrameCodec;
pub use crypto::{CryptoError, SessionCipher, SessionKey};
pub use handshake::{HandshakeError, HandshakeOutcome, InitiatorHandshake, ResponderHandshake};
pub use channel::MessageChannel;
