//! TCP listener for agent connections

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tb_core::config::RelayConfig;

use crate::registry::AgentRegistry;
use crate::server::connection::AgentConnection;

/// Accepts agent connections and spawns a driver task per link
pub struct RelayServer {
    config: Arc<RelayConfig>,
    registry: Arc<AgentRegistry>,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Create a server. Cancelling `cancel` stops the accept loop and
    /// every connection spawned from it.
    pub fn new(
        config: RelayConfig,
        registry: Arc<AgentRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            cancel,
        }
    }

    /// Bind the configured address and serve until cancelled
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        tracing::info!("Listening for agents on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Agent listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!("Agent connection from {}", peer);
                            let connection = AgentConnection::new(
                                stream,
                                peer.to_string(),
                                Arc::clone(&self.registry),
                                Arc::clone(&self.config),
                                self.cancel.child_token(),
                            );
                            tokio::spawn(connection.run());
                        }
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}
