//! tb-relay: termbridge relay daemon
//!
//! The relay accepts authenticated agent connections on a single TCP
//! port, tracks who is connected and which PTYs they share, and bridges
//! viewer front ends onto those agents. Agents dial out to the relay, so
//! only the relay needs a reachable address.

pub mod bridge;
pub mod registry;
pub mod server;

pub use bridge::{ViewerBridge, ViewerCommand, ViewerEvent};
pub use registry::{AgentCommand, AgentHandle, AgentRegistry};
pub use server::RelayServer;
