//! Dial-out connection to the relay

mod connection;

pub use connection::AgentClient;
