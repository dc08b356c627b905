//! Agent-facing TCP server

mod connection;
mod listener;

pub use listener::RelayServer;
