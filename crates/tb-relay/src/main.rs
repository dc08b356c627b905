//! termbridge relay daemon
//!
//! Runs on the machine viewers can reach. Accepts dial-out connections
//! from agents, authenticates them with the pre-shared key and routes
//! viewer traffic onto their PTYs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tb_core::config::{self, RelayConfig};
use tb_relay::{AgentRegistry, RelayServer};

#[derive(Parser)]
#[command(name = "tb-relay")]
#[command(about = "termbridge relay daemon")]
#[command(version)]
struct Args {
    /// Bind address for the agent listener (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Pre-shared key agents must present
    #[arg(long, env = "TERMBRIDGE_PSK")]
    preshared_key: Option<String>,

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

    tracing::info!("termbridge relay starting");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_relay_config_path);

    let mut config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            RelayConfig::default()
        })
    } else {
        RelayConfig::default()
    };

    // Command-line overrides
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(key) = args.preshared_key {
        config.preshared_key = key;
    }

    if config.preshared_key == RelayConfig::default().preshared_key {
        tracing::warn!(
            "Using the default pre-shared key; set one in {:?} or via --preshared-key",
            config_path
        );
    }

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down");
            }
        }

        cancel_clone.cancel();
    });

    let registry = Arc::new(AgentRegistry::new());
    let server = RelayServer::new(config, Arc::clone(&registry), cancel);
    server.run().await?;

    tracing::info!("Relay shutdown complete");
    Ok(())
}
