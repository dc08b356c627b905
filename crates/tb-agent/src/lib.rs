//! tb-agent: termbridge agent
//!
//! Hosts PTY sessions on the local machine and maintains an outbound,
//! PSK-authenticated connection to the relay. Remote viewers reach these
//! sessions only through the relay; the agent never listens on the
//! network.

pub mod client;
pub mod pty;

pub use client::AgentClient;
pub use pty::{PtyManager, PtySession};
