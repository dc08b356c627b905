//! Core error types for termbridge

use std::path::PathBuf;
use tb_protocol::{HandshakeError, ProtocolError};
use thiserror::Error;

/// Top-level error type for the termbridge ecosystem
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Handshake error
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// PTY process error
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// PTY process errors
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Opening the PTY pair failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// Spawning the child process failed
    #[error("Failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    /// Writing input to the PTY failed
    #[error("Write to PTY failed: {0}")]
    Write(String),

    /// Resizing the PTY failed
    #[error("Resize failed: {0}")]
    Resize(String),

    /// The session was already closed
    #[error("PTY is closed")]
    Closed,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
