//! termbridge agent daemon
//!
//! Runs on the machine whose terminals are shared. Dials out to the
//! relay, authenticates with the pre-shared key and serves PTY traffic
//! until stopped.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tb_agent::{AgentClient, PtyManager};
use tb_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "tb-agent")]
#[command(about = "termbridge agent - shares local terminals through a relay")]
#[command(version)]
struct Args {
    /// Relay to connect to (host or host:port)
    #[arg(short, long)]
    relay: Option<String>,

    /// Agent identity (defaults to the hostname)
    #[arg(long)]
    id: Option<String>,

    /// Pre-shared key for relay authentication
    #[arg(long, env = "TERMBRIDGE_PSK")]
    preshared_key: Option<String>,

    /// Refuse terminal creation requests from the relay side
    #[arg(long)]
    no_remote_create: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("termbridge agent starting");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_agent_config_path);

    let mut config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            AgentConfig::default()
        })
    } else {
        AgentConfig::default()
    };

    // Command-line overrides
    if let Some(relay) = args.relay {
        config.relay_address = if relay.contains(':') {
            relay
        } else {
            format!("{}:9090", relay)
        };
    }
    if let Some(id) = args.id {
        config.agent_id = Some(id);
    }
    if let Some(key) = args.preshared_key {
        config.preshared_key = key;
    }
    if args.no_remote_create {
        config.remote_create_enabled = false;
    }

    tracing::info!("Agent identity: {}", config.resolved_agent_id());
    tracing::info!("Relay address: {}", config.relay_address);

    let manager = Arc::new(PtyManager::new(&config));
    let mut client = AgentClient::new(config, manager);

    client
        .run()
        .await
        .context("Relay rejected the pre-shared key; check that agent and relay use the same key")
}
