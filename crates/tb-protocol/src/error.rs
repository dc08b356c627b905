//! Protocol error types

use thiserror::Error;

use crate::crypto::CryptoError;

/// Errors that can occur during protocol operations
///
/// Every variant is fatal for the connection it occurred on; the frame
/// layer never resynchronizes after a decode failure.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame did not start with the protocol magic
    #[error("Invalid frame magic: 0x{found:08x}")]
    BadMagic { found: u32 },

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Frame trailer checksum did not match the payload
    #[error("Frame checksum mismatch: frame carried 0x{expected:04x}, computed 0x{actual:04x}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Sealing or opening a payload failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
