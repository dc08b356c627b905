//! Driver for one agent connection
//!
//! Each accepted TCP stream gets an `AgentConnection` task. It walks the
//! responder side of the handshake (restarting on duplicate identities),
//! registers the agent, then multiplexes inbound frames against queued
//! registry commands until the link dies, the relay shuts down, or the
//! agent goes silent past the idle timeout.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tb_core::config::RelayConfig;
use tb_protocol::{Message, MessageChannel, ProtocolError, PtyInfo, ResponderHandshake};

use crate::registry::{AgentCommand, AgentHandle, AgentRegistry};

/// Rename awaiting its result, kept so the inventory snapshot can be
/// patched once the agent confirms
struct PendingRename {
    reply: oneshot::Sender<Result<(), String>>,
    pty_id: String,
    name: String,
}

pub(crate) struct AgentConnection<S> {
    channel: MessageChannel<S>,
    registry: Arc<AgentRegistry>,
    config: Arc<RelayConfig>,
    peer: String,
    cancel: CancellationToken,
    connection_id: Uuid,
    pending_creates: HashMap<String, oneshot::Sender<Result<PtyInfo, String>>>,
    pending_renames: HashMap<String, PendingRename>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AgentConnection<S> {
    pub(crate) fn new(
        stream: S,
        peer: String,
        registry: Arc<AgentRegistry>,
        config: Arc<RelayConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel: MessageChannel::new(stream),
            registry,
            config,
            peer,
            cancel,
            connection_id: Uuid::new_v4(),
            pending_creates: HashMap::new(),
            pending_renames: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let (agent_id, commands) = match self.authenticate().await {
            Ok(registration) => registration,
            Err(reason) => {
                tracing::debug!(
                    "Connection from {} ended before registration: {}",
                    self.peer,
                    reason
                );
                return;
            }
        };
        tracing::info!(
            "Agent {} registered from {} ({} online)",
            agent_id,
            self.peer,
            self.registry.len()
        );

        let reason = self.serve(&agent_id, commands).await;

        // Pending replies die with the connection; the oneshot receivers
        // observe the drop and report the disconnect.
        if self.registry.unregister(&agent_id, self.connection_id) {
            tracing::info!("Agent {} disconnected: {}", agent_id, reason);
        } else {
            tracing::debug!("Stale connection for {} finished: {}", agent_id, reason);
        }
    }

    /// Run the responder handshake to completion, registering the
    /// verified identity. Duplicate identities restart the handshake on
    /// this same connection; everything else is terminal.
    async fn authenticate(&mut self) -> Result<(String, mpsc::Receiver<AgentCommand>), String> {
        let mut handshake = ResponderHandshake::new(self.config.preshared_key.as_bytes());

        loop {
            let message = match timeout(self.config.idle_timeout, self.channel.recv()).await {
                Err(_) => return Err("handshake timed out".to_string()),
                Ok(None) => return Err("connection closed during handshake".to_string()),
                Ok(Some(Err(e))) => return Err(format!("protocol error: {}", e)),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::AuthRequest {
                    agent_id,
                    public_key,
                    nonce,
                    mac,
                } => match handshake.on_request(&agent_id, &public_key, &nonce, &mac) {
                    Ok(response) => {
                        if let Err(e) = self.channel.send(&response).await {
                            return Err(format!("send failed: {}", e));
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Rejecting agent {} from {}: {}", agent_id, self.peer, e);
                        let _ = self.channel.send(&ResponderHandshake::rejection()).await;
                        return Err(format!("authentication failed: {}", e));
                    }
                },

                Message::AuthFinish { mac, .. } => {
                    let verified_id = match handshake.on_finish(&mac) {
                        Ok(id) => id,
                        Err(e) => {
                            tracing::warn!("Handshake finish from {} failed: {}", self.peer, e);
                            let _ = self.channel.send(&ResponderHandshake::rejection()).await;
                            return Err(format!("authentication failed: {}", e));
                        }
                    };

                    let (command_tx, command_rx) =
                        mpsc::channel(self.config.command_queue_depth);
                    let handle = AgentHandle {
                        commands: command_tx,
                        cancel: self.cancel.clone(),
                        connection_id: self.connection_id,
                    };

                    if self.registry.try_register(&verified_id, handle) {
                        match handshake.accept() {
                            Ok((result, key)) => {
                                if let Err(e) = self.channel.send(&result).await {
                                    self.registry.unregister(&verified_id, self.connection_id);
                                    return Err(format!("send failed: {}", e));
                                }
                                self.channel.install_cipher(key.cipher());
                                return Ok((verified_id, command_rx));
                            }
                            Err(e) => {
                                self.registry.unregister(&verified_id, self.connection_id);
                                return Err(format!("handshake state error: {}", e));
                            }
                        }
                    }

                    tracing::info!(
                        "Agent id {} is already connected; asking {} to retry suffixed",
                        verified_id,
                        self.peer
                    );
                    match handshake.reject_duplicate() {
                        Ok(retry) => {
                            if let Err(e) = self.channel.send(&retry).await {
                                return Err(format!("send failed: {}", e));
                            }
                        }
                        Err(e) => return Err(format!("handshake state error: {}", e)),
                    }
                }

                other => {
                    tracing::warn!(
                        "Unexpected {} from {} during handshake",
                        other.kind(),
                        self.peer
                    );
                    let _ = self.channel.send(&ResponderHandshake::rejection()).await;
                    return Err(format!("unexpected {} during handshake", other.kind()));
                }
            }
        }
    }

    /// Multiplex the registered connection until it ends. Returns the
    /// disconnect reason for logging.
    async fn serve(
        &mut self,
        agent_id: &str,
        mut commands: mpsc::Receiver<AgentCommand>,
    ) -> String {
        // Warm the inventory snapshot right away.
        if let Err(e) = self.channel.send(&Message::PtyListRequest).await {
            return format!("send failed: {}", e);
        }

        let cancel = self.cancel.clone();
        let idle = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return "relay shutting down".to_string();
                }
                _ = &mut idle => {
                    return format!("no frames for {:?}", self.config.idle_timeout);
                }
                message = self.channel.recv() => {
                    idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                    match message {
                        None => return "connection closed by agent".to_string(),
                        Some(Err(e)) => return format!("protocol error: {}", e),
                        Some(Ok(message)) => {
                            if let Err(e) = self.handle_message(agent_id, message).await {
                                return format!("send failed: {}", e);
                            }
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                return format!("send failed: {}", e);
                            }
                        }
                        // All senders live in the registry; losing them
                        // means the entry was removed underneath us.
                        None => return "unregistered".to_string(),
                    }
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        agent_id: &str,
        message: Message,
    ) -> Result<(), ProtocolError> {
        match message {
            Message::Heartbeat => {
                tracing::trace!("Heartbeat from {}", agent_id);
                self.channel.send(&Message::Heartbeat).await?;
            }

            Message::PtyOutput { pty_id, data } => {
                tracing::trace!("{} output bytes from {}:{}", data.len(), agent_id, pty_id);
                self.registry.forward_output(agent_id, &pty_id, data);
            }

            Message::PtyListResponse { ptys } => {
                tracing::debug!("Agent {} reports {} remote ptys", agent_id, ptys.len());
                self.registry.update_pty_list(agent_id, ptys);
            }

            Message::PtyVisibilityChanged { pty_id, visible } => {
                if visible {
                    tracing::debug!("Agent {} re-shared {}", agent_id, pty_id);
                } else {
                    tracing::info!("Agent {} stopped sharing {}", agent_id, pty_id);
                    self.registry.visibility_disabled(agent_id, &pty_id);
                }
            }

            Message::PtyCreateResult { request_id, result } => {
                if let Ok(info) = &result {
                    self.registry.upsert_pty(agent_id, info.clone());
                }
                match self.pending_creates.remove(&request_id) {
                    // The waiter may have timed out; dropping the value
                    // is fine then.
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => tracing::debug!(
                        "Unsolicited create result {} from {}",
                        request_id,
                        agent_id
                    ),
                }
            }

            Message::PtyRenameResult { request_id, result } => {
                match self.pending_renames.remove(&request_id) {
                    Some(pending) => {
                        if result.is_ok() {
                            self.registry
                                .rename_pty(agent_id, &pending.pty_id, &pending.name);
                        }
                        let _ = pending.reply.send(result);
                    }
                    None => tracing::debug!(
                        "Unsolicited rename result {} from {}",
                        request_id,
                        agent_id
                    ),
                }
            }

            other => {
                tracing::warn!("Unexpected {} from agent {}", other.kind(), agent_id);
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: AgentCommand) -> Result<(), ProtocolError> {
        let message = match command {
            AgentCommand::Attach { pty_id } => Message::PtyAttach { pty_id },
            AgentCommand::Detach { pty_id } => Message::PtyDetach { pty_id },
            AgentCommand::Input { pty_id, data } => Message::PtyInput { pty_id, data },
            AgentCommand::Resize { pty_id, cols, rows } => {
                Message::PtyResize { pty_id, cols, rows }
            }
            AgentCommand::Close { pty_id } => Message::PtyClose { pty_id },
            AgentCommand::ListPtys => Message::PtyListRequest,
            AgentCommand::Create {
                request_id,
                name,
                cols,
                rows,
                reply,
            } => {
                self.pending_creates.insert(request_id.clone(), reply);
                Message::PtyCreate {
                    request_id,
                    name,
                    cols,
                    rows,
                }
            }
            AgentCommand::Rename {
                request_id,
                pty_id,
                name,
                reply,
            } => {
                self.pending_renames.insert(
                    request_id.clone(),
                    PendingRename {
                        reply,
                        pty_id: pty_id.clone(),
                        name: name.clone(),
                    },
                );
                Message::PtyRename {
                    request_id,
                    pty_id,
                    name,
                }
            }
        };
        self.channel.send(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tb_protocol::{HandshakeError, InitiatorHandshake};

    fn test_connection(
        psk: &str,
    ) -> (
        AgentConnection<tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
        Arc<AgentRegistry>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let registry = Arc::new(AgentRegistry::new());
        let config = Arc::new(RelayConfig {
            preshared_key: psk.to_string(),
            ..RelayConfig::default()
        });
        let connection = AgentConnection::new(
            server_io,
            "test-peer".to_string(),
            Arc::clone(&registry),
            config,
            CancellationToken::new(),
        );
        (connection, client_io, registry)
    }

    #[tokio::test]
    async fn test_wrong_psk_is_rejected_without_registration() {
        let (connection, client_io, registry) = test_connection("right-key");
        let server = tokio::spawn(connection.run());

        let mut channel = MessageChannel::new(client_io);
        let mut handshake = InitiatorHandshake::new("wrong-key".as_bytes(), "host");
        channel.send(&handshake.start()).await.unwrap();

        match channel.recv().await.unwrap().unwrap() {
            Message::AuthResult { outcome, mac } => {
                assert!(matches!(
                    handshake.on_result(outcome, &mac),
                    Err(HandshakeError::Rejected)
                ));
            }
            other => panic!("Expected auth result, got {}", other.kind()),
        }

        server.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_message_during_handshake_is_rejected() {
        let (connection, client_io, registry) = test_connection("key");
        let server = tokio::spawn(connection.run());

        let mut channel = MessageChannel::new(client_io);
        channel.send(&Message::Heartbeat).await.unwrap();

        match channel.recv().await.unwrap().unwrap() {
            Message::AuthResult { outcome, .. } => {
                assert_eq!(outcome, tb_protocol::AuthOutcome::InvalidAuth);
            }
            other => panic!("Expected auth result, got {}", other.kind()),
        }
        assert!(channel.recv().await.is_none());

        server.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_successful_handshake_registers_and_seals() {
        let (connection, client_io, registry) = test_connection("shared");
        let server = tokio::spawn(connection.run());

        let mut channel = MessageChannel::new(client_io);
        let mut handshake = InitiatorHandshake::new("shared".as_bytes(), "unit-host");
        channel.send(&handshake.start()).await.unwrap();

        match channel.recv().await.unwrap().unwrap() {
            Message::AuthResponse {
                public_key,
                nonce,
                mac,
            } => {
                let finish = handshake.on_response(&public_key, &nonce, &mac).unwrap();
                channel.send(&finish).await.unwrap();
            }
            other => panic!("Expected auth response, got {}", other.kind()),
        }

        match channel.recv().await.unwrap().unwrap() {
            Message::AuthResult { outcome, mac } => {
                match handshake.on_result(outcome, &mac).unwrap() {
                    tb_protocol::HandshakeOutcome::Authenticated(key) => {
                        channel.install_cipher(key.cipher());
                    }
                    other => panic!("Expected authenticated, got {:?}", other),
                }
            }
            other => panic!("Expected auth result, got {}", other.kind()),
        }

        assert!(registry.agent("unit-host").is_some());

        // The first sealed frame is the inventory request.
        match channel.recv().await.unwrap().unwrap() {
            Message::PtyListRequest => {}
            other => panic!("Expected list request, got {}", other.kind()),
        }

        // Dropping the client tears the connection down and unregisters.
        drop(channel);
        server.await.unwrap();
        assert!(registry.agent("unit-host").is_none());
    }
}
