//! Relay connection lifecycle
//!
//! The agent dials out, authenticates with the PSK handshake and then
//! serves relay commands until the connection drops. PTY sessions and
//! their history outlive connections; everything else here is
//! per-connection state and is torn down with it.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;

use tb_core::agent_id;
use tb_core::config::AgentConfig;
use tb_core::BridgeError;
use tb_protocol::{
    HandshakeError, HandshakeOutcome, InitiatorHandshake, Message, MessageChannel, ProtocolError,
    PtyInfo,
};

use crate::pty::{PtyManager, PtySession};

/// Capacity of the channel between PTY-facing tasks and the connection
/// loop
const AGENT_EVENT_CAPACITY: usize = 256;

/// How long a cancelled forwarder gets to wind down
const FORWARDER_SHUTDOWN: Duration = Duration::from_millis(500);

/// Events funneled from PTY-facing tasks into the connection loop
enum AgentEvent {
    Output { pty_id: String, data: Bytes },
    VisibilityDisabled { pty_id: String },
}

/// Maintains the agent's connection to the relay across reconnects
pub struct AgentClient {
    config: AgentConfig,
    manager: Arc<PtyManager>,
    base_id: String,
    suffix: u32,
}

impl AgentClient {
    pub fn new(config: AgentConfig, manager: Arc<PtyManager>) -> Self {
        let base_id = config.resolved_agent_id();
        Self {
            config,
            manager,
            base_id,
            suffix: 1,
        }
    }

    /// The identity currently claimed, including any duplicate suffix.
    /// A suffix acquired on one connection sticks for later reconnects.
    pub fn agent_id(&self) -> String {
        agent_id::with_suffix(&self.base_id, self.suffix)
    }

    /// Connect, serve, reconnect, forever. Returns only when the relay
    /// rejects the pre-shared key outright.
    pub async fn run(&mut self) -> Result<(), BridgeError> {
        loop {
            match self.connect_and_serve().await {
                Ok(reason) => tracing::warn!("Disconnected: {}", reason),
                Err(e @ BridgeError::Handshake(HandshakeError::Rejected)) => return Err(e),
                Err(e) => tracing::warn!("Connection failed: {}", e),
            }
            sleep(self.config.reconnect_delay).await;
            tracing::info!("Reconnecting to {}", self.config.relay_address);
        }
    }

    async fn connect_and_serve(&mut self) -> Result<String, BridgeError> {
        tracing::debug!("Connecting to {}", self.config.relay_address);
        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.relay_address),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        let mut channel = MessageChannel::new(stream);
        self.authenticate(&mut channel).await?;
        tracing::info!("Registered with relay as {}", self.agent_id());
        Ok(self.serve(channel).await)
    }

    /// Run the initiator handshake, retrying under suffixed identities
    /// while the relay reports the current one as taken.
    async fn authenticate<S>(&mut self, channel: &mut MessageChannel<S>) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut handshake =
            InitiatorHandshake::new(self.config.preshared_key.as_bytes(), self.agent_id());
        let mut attempts = 1u32;
        channel.send(&handshake.start()).await?;

        loop {
            let message = match channel.recv().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "relay closed during handshake",
                    )
                    .into())
                }
            };

            match message {
                Message::AuthResponse {
                    public_key,
                    nonce,
                    mac,
                } => {
                    let finish = handshake.on_response(&public_key, &nonce, &mac)?;
                    channel.send(&finish).await?;
                }
                Message::AuthResult { outcome, mac } => {
                    match handshake.on_result(outcome, &mac)? {
                        HandshakeOutcome::Authenticated(key) => {
                            channel.install_cipher(key.cipher());
                            return Ok(());
                        }
                        HandshakeOutcome::DuplicateIdentity => {
                            if attempts >= self.config.max_identity_attempts {
                                return Err(HandshakeError::AttemptsExhausted { attempts }.into());
                            }
                            attempts += 1;
                            self.suffix += 1;
                            let next = self.agent_id();
                            tracing::warn!(
                                "Identity {} already connected, retrying as {}",
                                handshake.agent_id(),
                                next
                            );
                            channel.send(&handshake.restart_as(next)).await?;
                        }
                    }
                }
                other => {
                    return Err(HandshakeError::UnexpectedMessage {
                        got: other.kind(),
                        state: "client-auth",
                    }
                    .into())
                }
            }
        }
    }

    /// Serve one authenticated connection; returns the disconnect reason
    async fn serve<S>(&self, channel: MessageChannel<S>) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (events_tx, events_rx) = mpsc::channel(AGENT_EVENT_CAPACITY);
        let mut connection = ConnectionTask {
            channel,
            manager: Arc::clone(&self.manager),
            agent_id: self.agent_id(),
            events_tx,
            forwarders: HashMap::new(),
            cancel: CancellationToken::new(),
        };
        let reason = connection
            .run(events_rx, self.config.heartbeat_interval)
            .await;
        connection.teardown().await;
        reason
    }
}

/// Per-connection state: the sealed channel plus every task spawned on
/// behalf of this connection
struct ConnectionTask<S> {
    channel: MessageChannel<S>,
    manager: Arc<PtyManager>,
    agent_id: String,
    events_tx: mpsc::Sender<AgentEvent>,
    forwarders: HashMap<String, (JoinHandle<()>, CancellationToken)>,
    cancel: CancellationToken,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectionTask<S> {
    async fn run(
        &mut self,
        mut events_rx: mpsc::Receiver<AgentEvent>,
        heartbeat_interval: Duration,
    ) -> String {
        self.start_visibility_watchers();

        let mut heartbeat = interval(heartbeat_interval);
        loop {
            tokio::select! {
                message = self.channel.recv() => {
                    match message {
                        Some(Ok(message)) => {
                            if let Err(e) = self.handle_message(message).await {
                                return format!("send failed: {}", e);
                            }
                        }
                        Some(Err(e)) => return format!("protocol error: {}", e),
                        None => return "connection closed by relay".to_string(),
                    }
                }
                _ = heartbeat.tick() => {
                    if self.channel.send(&Message::Heartbeat).await.is_err() {
                        return "heartbeat send failed".to_string();
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                return format!("send failed: {}", e);
                            }
                        }
                        None => return "event channel closed".to_string(),
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), ProtocolError> {
        match message {
            Message::PtyListRequest => {
                let ptys = self.manager.remote_viewable_infos().await;
                self.channel.send(&Message::PtyListResponse { ptys }).await?;
            }
            Message::PtyAttach { pty_id } => self.handle_attach(pty_id).await?,
            Message::PtyDetach { pty_id } => self.stop_forwarder(&pty_id).await,
            Message::PtyInput { pty_id, data } => match self.viewable_session(&pty_id) {
                Some(session) => {
                    if let Err(e) = session.write(&data).await {
                        tracing::warn!("Write to PTY {} failed: {}", pty_id, e);
                    }
                }
                None => tracing::debug!("Input for unknown PTY {}", pty_id),
            },
            Message::PtyResize { pty_id, cols, rows } => {
                if let Some(session) = self.viewable_session(&pty_id) {
                    if let Err(e) = session.resize(cols, rows).await {
                        tracing::warn!("Resize of PTY {} failed: {}", pty_id, e);
                    }
                }
            }
            Message::PtyClose { pty_id } => {
                self.stop_forwarder(&pty_id).await;
                if self.manager.remove(&pty_id).await {
                    tracing::info!("Closed PTY {} on relay request", pty_id);
                }
            }
            Message::PtyCreate {
                request_id, name, ..
            } => {
                let result = self.create_remote_pty(name).await;
                self.channel
                    .send(&Message::PtyCreateResult { request_id, result })
                    .await?;
            }
            Message::PtyRename {
                request_id,
                pty_id,
                name,
            } => {
                let result = self.rename_pty(&pty_id, name).await;
                self.channel
                    .send(&Message::PtyRenameResult { request_id, result })
                    .await?;
            }
            Message::Heartbeat => tracing::trace!("Heartbeat echo"),
            other => tracing::warn!("Unexpected message from relay: {}", other.kind()),
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: AgentEvent) -> Result<(), ProtocolError> {
        match event {
            AgentEvent::Output { pty_id, data } => {
                self.channel.send(&Message::PtyOutput { pty_id, data }).await?;
            }
            AgentEvent::VisibilityDisabled { pty_id } => {
                self.stop_forwarder(&pty_id).await;
                self.channel
                    .send(&Message::PtyVisibilityChanged {
                        pty_id,
                        visible: false,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn viewable_session(&self, pty_id: &str) -> Option<Arc<PtySession>> {
        self.manager.get(pty_id).filter(|s| s.is_remote_viewable())
    }

    /// Start forwarding a PTY's output. Buffered history goes out first
    /// so a newly attached viewer sees scrollback; attaching again
    /// replaces the previous forwarder.
    async fn handle_attach(&mut self, pty_id: String) -> Result<(), ProtocolError> {
        let session = match self.viewable_session(&pty_id) {
            Some(session) => session,
            None => {
                tracing::debug!("Attach to unknown or private PTY {}", pty_id);
                return Ok(());
            }
        };
        self.stop_forwarder(&pty_id).await;

        let (history, mut output_rx) = session.attach_output().await;
        if !history.is_empty() {
            self.channel
                .send(&Message::PtyOutput {
                    pty_id: pty_id.clone(),
                    data: history,
                })
                .await?;
        }

        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let events_tx = self.events_tx.clone();
        let forward_id = pty_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    chunk = output_rx.recv() => match chunk {
                        Some(data) => {
                            let event = AgentEvent::Output {
                                pty_id: forward_id.clone(),
                                data,
                            };
                            if events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        self.forwarders.insert(pty_id.clone(), (handle, cancel));
        tracing::debug!("Forwarding PTY {}", pty_id);
        Ok(())
    }

    async fn stop_forwarder(&mut self, pty_id: &str) {
        if let Some((handle, cancel)) = self.forwarders.remove(pty_id) {
            cancel.cancel();
            let _ = timeout(FORWARDER_SHUTDOWN, handle).await;
            tracing::debug!("Stopped forwarding PTY {}", pty_id);
        }
    }

    async fn create_remote_pty(&self, name: Option<String>) -> Result<PtyInfo, String> {
        if !self.manager.remote_create_enabled() {
            return Err("Remote terminal creation is disabled on this agent".to_string());
        }
        let name = self
            .manager
            .unique_remote_name(&self.agent_id, name.as_deref())
            .await;
        match self.manager.create(name, true, true) {
            Ok(session) => Ok(session.info().await),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn rename_pty(&self, pty_id: &str, name: String) -> Result<(), String> {
        let name = name.trim();
        if name.is_empty() {
            return Err("Name must not be empty".to_string());
        }
        match self.viewable_session(pty_id) {
            Some(session) => {
                session.rename(name).await;
                Ok(())
            }
            None => Err(format!("Unknown terminal {}", pty_id)),
        }
    }

    /// Watch every session's visibility channel, plus sessions created
    /// later, and funnel disable transitions into the connection loop
    fn start_visibility_watchers(&self) {
        for session in self.manager.get_all() {
            spawn_visibility_watcher(session, self.events_tx.clone(), self.cancel.child_token());
        }

        let mut created_rx = self.manager.created_events();
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    created = created_rx.recv() => match created {
                        Ok(session) => spawn_visibility_watcher(
                            session,
                            events_tx.clone(),
                            cancel.child_token(),
                        ),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("Missed {} PTY creation events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Cancel every task spawned for this connection. Sessions and their
    /// history stay with the manager.
    async fn teardown(&mut self) {
        self.cancel.cancel();
        let forwarders = std::mem::take(&mut self.forwarders);
        for (pty_id, (handle, cancel)) in forwarders {
            cancel.cancel();
            let _ = timeout(FORWARDER_SHUTDOWN, handle).await;
            tracing::debug!("Forwarder for PTY {} stopped on disconnect", pty_id);
        }
    }
}

fn spawn_visibility_watcher(
    session: Arc<PtySession>,
    events_tx: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut visibility = session.watch_visibility();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = visibility.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let visible = *visibility.borrow_and_update();
                    if !visible {
                        let event = AgentEvent::VisibilityDisabled {
                            pty_id: session.id().to_string(),
                        };
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use tb_protocol::ResponderHandshake;

    fn test_config(agent_id: &str) -> AgentConfig {
        AgentConfig {
            agent_id: Some(agent_id.to_string()),
            preshared_key: "test-token".to_string(),
            max_identity_attempts: 3,
            ..AgentConfig::default()
        }
    }

    fn test_client(agent_id: &str) -> AgentClient {
        let config = test_config(agent_id);
        let manager = Arc::new(PtyManager::new(&config));
        AgentClient::new(config, manager)
    }

    /// Drive the relay half of one complete handshake round, returning
    /// the verified identity with the responder left in the verified
    /// state.
    async fn respond_one_round<S>(
        channel: &mut MessageChannel<S>,
        responder: &mut ResponderHandshake,
    ) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let response = match channel.recv().await.unwrap().unwrap() {
            Message::AuthRequest {
                agent_id,
                public_key,
                nonce,
                mac,
            } => responder
                .on_request(&agent_id, &public_key, &nonce, &mac)
                .unwrap(),
            other => panic!("Expected AuthRequest, got {}", other.kind()),
        };
        channel.send(&response).await.unwrap();

        match channel.recv().await.unwrap().unwrap() {
            Message::AuthFinish { mac, .. } => responder.on_finish(&mac).unwrap(),
            other => panic!("Expected AuthFinish, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_authenticate_installs_cipher() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut client = test_client("my-host");

        let client_task = tokio::spawn(async move {
            let mut channel = MessageChannel::new(client_io);
            client.authenticate(&mut channel).await.map(|_| (client, channel))
        });

        let mut server = MessageChannel::new(server_io);
        let mut responder = ResponderHandshake::new(b"test-token".as_slice());
        let verified = respond_one_round(&mut server, &mut responder).await;
        assert_eq!(verified, "my-host");

        let (result, key) = responder.accept().unwrap();
        server.send(&result).await.unwrap();
        server.install_cipher(key.cipher());

        let (client, mut channel) = client_task.await.unwrap().unwrap();
        assert_eq!(client.agent_id(), "my-host");
        assert!(channel.is_sealed());

        // Sealed traffic flows both ways
        channel.send(&Message::Heartbeat).await.unwrap();
        assert!(matches!(
            server.recv().await.unwrap().unwrap(),
            Message::Heartbeat
        ));
    }

    #[tokio::test]
    async fn test_authenticate_retries_suffixed_identity() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut client = test_client("my-host");

        let client_task = tokio::spawn(async move {
            let mut channel = MessageChannel::new(client_io);
            client.authenticate(&mut channel).await.map(|_| client)
        });

        let mut server = MessageChannel::new(server_io);
        let mut responder = ResponderHandshake::new(b"test-token".as_slice());

        assert_eq!(respond_one_round(&mut server, &mut responder).await, "my-host");
        server.send(&responder.reject_duplicate().unwrap()).await.unwrap();

        assert_eq!(
            respond_one_round(&mut server, &mut responder).await,
            "my-host-2"
        );
        let (result, _key) = responder.accept().unwrap();
        server.send(&result).await.unwrap();

        let client = client_task.await.unwrap().unwrap();
        assert_eq!(client.agent_id(), "my-host-2");
    }

    #[tokio::test]
    async fn test_authenticate_rejected_on_wrong_psk() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut client = test_client("my-host");

        let client_task = tokio::spawn(async move {
            let mut channel = MessageChannel::new(client_io);
            client.authenticate(&mut channel).await
        });

        let mut server = MessageChannel::new(server_io);
        let mut responder = ResponderHandshake::new(b"other-token".as_slice());

        match server.recv().await.unwrap().unwrap() {
            Message::AuthRequest {
                agent_id,
                public_key,
                nonce,
                mac,
            } => {
                assert!(responder
                    .on_request(&agent_id, &public_key, &nonce, &mac)
                    .is_err());
            }
            other => panic!("Expected AuthRequest, got {}", other.kind()),
        }
        server.send(&ResponderHandshake::rejection()).await.unwrap();

        let result = client_task.await.unwrap();
        assert!(matches!(
            result,
            Err(BridgeError::Handshake(HandshakeError::Rejected))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_bounds_identity_attempts() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut client = test_client("my-host");
        client.config.max_identity_attempts = 2;

        let client_task = tokio::spawn(async move {
            let mut channel = MessageChannel::new(client_io);
            client.authenticate(&mut channel).await
        });

        let mut server = MessageChannel::new(server_io);
        let mut responder = ResponderHandshake::new(b"test-token".as_slice());

        respond_one_round(&mut server, &mut responder).await;
        server.send(&responder.reject_duplicate().unwrap()).await.unwrap();
        respond_one_round(&mut server, &mut responder).await;
        server.send(&responder.reject_duplicate().unwrap()).await.unwrap();

        let result = client_task.await.unwrap();
        assert!(matches!(
            result,
            Err(BridgeError::Handshake(
                HandshakeError::AttemptsExhausted { attempts: 2 }
            ))
        ));
    }

    #[cfg(unix)]
    fn pty_config(agent_id: &str) -> AgentConfig {
        AgentConfig {
            agent_id: Some(agent_id.to_string()),
            preshared_key: "test-token".to_string(),
            shell: Some("/bin/sh".to_string()),
            // Deterministic first output, then hold the PTY open
            shell_args: vec!["-c".to_string(), "printf ready && cat".to_string()],
            working_directory: Some(std::env::temp_dir()),
            heartbeat_interval: Duration::from_secs(600),
            ..AgentConfig::default()
        }
    }

    /// Authenticate both halves of a duplex pair, returning the client and
    /// its sealed channel plus the sealed relay-side channel.
    #[cfg(unix)]
    async fn sealed_pair(
        config: AgentConfig,
    ) -> (
        AgentClient,
        MessageChannel<tokio::io::DuplexStream>,
        MessageChannel<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let manager = Arc::new(PtyManager::new(&config));
        let mut client = AgentClient::new(config, manager);

        let client_task = tokio::spawn(async move {
            let mut channel = MessageChannel::new(client_io);
            client
                .authenticate(&mut channel)
                .await
                .map(|_| (client, channel))
        });

        let mut server = MessageChannel::new(server_io);
        let mut responder = ResponderHandshake::new(b"test-token".as_slice());
        respond_one_round(&mut server, &mut responder).await;
        let (result, key) = responder.accept().unwrap();
        server.send(&result).await.unwrap();
        server.install_cipher(key.cipher());

        let (client, channel) = client_task.await.unwrap().unwrap();
        (client, channel, server)
    }

    /// Next message that is not a heartbeat (the loop sends one up front)
    #[cfg(unix)]
    async fn recv_non_heartbeat<S>(channel: &mut MessageChannel<S>) -> Message
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let message = timeout(Duration::from_secs(5), channel.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("channel closed")
                .expect("protocol error");
            if !matches!(message, Message::Heartbeat) {
                return message;
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serve_attach_replays_history_then_forwards_until_detach() {
        let (client, channel, mut server) = sealed_pair(pty_config("my-host")).await;
        let manager = Arc::clone(&client.manager);
        let session = manager.create("shared", true, false).unwrap();
        let pty_id = session.id().to_string();

        // Wait for the shell's first output to land in history
        let seeded = timeout(Duration::from_secs(5), async {
            while !session
                .history_snapshot()
                .await
                .windows(5)
                .any(|w| w == b"ready")
            {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(seeded.is_ok(), "Timed out waiting for PTY output");

        let driver = async {
            server
                .send(&Message::PtyAttach {
                    pty_id: pty_id.clone(),
                })
                .await
                .unwrap();
            match recv_non_heartbeat(&mut server).await {
                Message::PtyOutput { pty_id: got, data } => {
                    assert_eq!(got, pty_id);
                    assert!(data.windows(5).any(|w| w == b"ready"));
                }
                other => panic!("Expected history PtyOutput, got {}", other.kind()),
            }

            server
                .send(&Message::PtyInput {
                    pty_id: pty_id.clone(),
                    data: Bytes::from_static(b"ping\n"),
                })
                .await
                .unwrap();
            let mut seen: Vec<u8> = Vec::new();
            while !seen.windows(4).any(|w| w == b"ping") {
                match recv_non_heartbeat(&mut server).await {
                    Message::PtyOutput { data, .. } => seen.extend_from_slice(&data),
                    other => panic!("Expected live PtyOutput, got {}", other.kind()),
                }
            }

            server
                .send(&Message::PtyDetach {
                    pty_id: pty_id.clone(),
                })
                .await
                .unwrap();
            server
                .send(&Message::PtyInput {
                    pty_id: pty_id.clone(),
                    data: Bytes::from_static(b"quiet\n"),
                })
                .await
                .unwrap();

            // Chunks forwarded before the detach landed may still drain
            // out, but the post-detach input must never come back
            let mut residue: Vec<u8> = Vec::new();
            loop {
                match timeout(Duration::from_millis(300), recv_non_heartbeat(&mut server)).await {
                    Err(_) => break,
                    Ok(Message::PtyOutput { data, .. }) => residue.extend_from_slice(&data),
                    Ok(other) => panic!("Unexpected message after detach: {}", other.kind()),
                }
            }
            assert!(
                !residue.windows(5).any(|w| w == b"quiet"),
                "Output forwarded after detach"
            );
            drop(server);
        };

        let (reason, ()) = tokio::join!(client.serve(channel), driver);
        assert_eq!(reason, "connection closed by relay");
        manager.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serve_remote_create_gate_and_rename() {
        let (client, channel, mut server) = sealed_pair(pty_config("my-host")).await;
        let manager = Arc::clone(&client.manager);
        manager.set_remote_create_enabled(false);

        let driver = async {
            server
                .send(&Message::PtyCreate {
                    request_id: "req-1".to_string(),
                    name: None,
                    cols: 80,
                    rows: 24,
                })
                .await
                .unwrap();
            match recv_non_heartbeat(&mut server).await {
                Message::PtyCreateResult { request_id, result } => {
                    assert_eq!(request_id, "req-1");
                    assert!(result.is_err());
                }
                other => panic!("Expected PtyCreateResult, got {}", other.kind()),
            }
            assert!(manager.is_empty());

            manager.set_remote_create_enabled(true);
            server
                .send(&Message::PtyCreate {
                    request_id: "req-2".to_string(),
                    name: Some("build".to_string()),
                    cols: 80,
                    rows: 24,
                })
                .await
                .unwrap();
            let info = match recv_non_heartbeat(&mut server).await {
                Message::PtyCreateResult { request_id, result } => {
                    assert_eq!(request_id, "req-2");
                    result.unwrap()
                }
                other => panic!("Expected PtyCreateResult, got {}", other.kind()),
            };
            assert_eq!(info.name, "my-host-build");
            assert!(info.remote_viewable);
            assert!(info.remote_created);

            server
                .send(&Message::PtyRename {
                    request_id: "req-3".to_string(),
                    pty_id: info.id.clone(),
                    name: "   ".to_string(),
                })
                .await
                .unwrap();
            match recv_non_heartbeat(&mut server).await {
                Message::PtyRenameResult { request_id, result } => {
                    assert_eq!(request_id, "req-3");
                    assert!(result.is_err());
                }
                other => panic!("Expected PtyRenameResult, got {}", other.kind()),
            }

            server
                .send(&Message::PtyRename {
                    request_id: "req-4".to_string(),
                    pty_id: info.id.clone(),
                    name: "deploy".to_string(),
                })
                .await
                .unwrap();
            match recv_non_heartbeat(&mut server).await {
                Message::PtyRenameResult { request_id, result } => {
                    assert_eq!(request_id, "req-4");
                    assert!(result.is_ok());
                }
                other => panic!("Expected PtyRenameResult, got {}", other.kind()),
            }
            assert_eq!(manager.get(&info.id).unwrap().name().await, "deploy");
            drop(server);
        };

        let (reason, ()) = tokio::join!(client.serve(channel), driver);
        assert_eq!(reason, "connection closed by relay");
        manager.shutdown().await;
    }
}
