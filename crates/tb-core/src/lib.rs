//! tb-core: Core abstractions and configuration for termbridge
//!
//! This crate provides the shared error taxonomy, configuration
//! structures and agent identity helpers used by both the agent and the
//! relay.

pub mod agent_id;
pub mod config;
pub mod error;

pub use error::{BridgeError, ConfigError, ProcessError};
