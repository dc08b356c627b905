//! Viewer-facing bridge
//!
//! A `ViewerBridge` is the typed surface one front-end connection drives.
//! It translates viewer commands into registry bookkeeping and agent
//! commands, and the viewer receives everything back over a single event
//! channel: direct replies from the bridge plus output and visibility
//! events fanned out by the registry.
//!
//! PTY ids on this surface are relay-wide (`agent:pty`); the bridge
//! splits them before talking to an agent. The transport that carries
//! commands and events to an actual browser is not this crate's concern.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use tb_core::config::RelayConfig;
use tb_protocol::PtyInfo;

use crate::registry::{full_pty_id, split_pty_id, AgentCommand, AgentRegistry};

/// Queue depth of one viewer's event channel
const VIEWER_EVENT_CAPACITY: usize = 256;

/// Commands a viewer can issue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerCommand {
    /// List remote-viewable PTYs across all connected agents
    ListRemote,
    /// Start receiving output for a PTY
    Attach { pty_id: String },
    /// Stop receiving output for a PTY
    Detach { pty_id: String },
    /// Send input bytes to a PTY
    Input { pty_id: String, data: Bytes },
    /// Resize a PTY
    Resize { pty_id: String, cols: u16, rows: u16 },
    /// Close a PTY on its agent
    Close { pty_id: String },
    /// Create a PTY on a specific agent
    Create {
        agent_id: String,
        name: Option<String>,
        cols: u16,
        rows: u16,
    },
    /// Rename a PTY on its agent
    Rename { pty_id: String, name: String },
}

/// Events delivered back to a viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerEvent {
    /// Answer to `ListRemote`
    RemoteList { ptys: Vec<PtyInfo> },
    /// The viewer is now attached to this PTY
    Attached { pty_id: String },
    /// The viewer is no longer attached to this PTY
    Detached { pty_id: String },
    /// Output bytes from an attached PTY
    Output { pty_id: String, data: Bytes },
    /// The agent revoked remote viewing of this PTY
    VisibilityDisabled { pty_id: String },
    /// A close request was forwarded for this PTY
    Closed { pty_id: String },
    /// Answer to `Create`
    Created { pty: PtyInfo },
    /// Answer to `Rename`
    Renamed { pty_id: String, name: String },
    /// A command failed
    Error { message: String },
}

/// Bridge between one viewer and the agent registry
pub struct ViewerBridge {
    registry: Arc<AgentRegistry>,
    viewer_id: Uuid,
    events: mpsc::Sender<ViewerEvent>,
    /// Full ids this viewer currently holds an attachment on
    attached: HashSet<String>,
    list_refresh_wait: Duration,
    request_timeout: Duration,
}

impl ViewerBridge {
    /// Create a bridge and the event channel its viewer reads from
    pub fn new(
        registry: Arc<AgentRegistry>,
        config: &RelayConfig,
    ) -> (Self, mpsc::Receiver<ViewerEvent>) {
        let (events, events_rx) = mpsc::channel(VIEWER_EVENT_CAPACITY);
        let bridge = Self {
            registry,
            viewer_id: Uuid::new_v4(),
            events,
            attached: HashSet::new(),
            list_refresh_wait: config.list_refresh_wait,
            request_timeout: config.request_timeout,
        };
        (bridge, events_rx)
    }

    /// Id under which this viewer's subscriptions are registered
    pub fn viewer_id(&self) -> Uuid {
        self.viewer_id
    }

    /// Dispatch one viewer command
    pub async fn handle(&mut self, command: ViewerCommand) {
        match command {
            ViewerCommand::ListRemote => self.list_remote().await,
            ViewerCommand::Attach { pty_id } => self.attach(pty_id).await,
            ViewerCommand::Detach { pty_id } => self.detach(pty_id).await,
            ViewerCommand::Input { pty_id, data } => self.input(pty_id, data).await,
            ViewerCommand::Resize { pty_id, cols, rows } => self.resize(pty_id, cols, rows).await,
            ViewerCommand::Close { pty_id } => self.close(pty_id).await,
            ViewerCommand::Create {
                agent_id,
                name,
                cols,
                rows,
            } => self.create(agent_id, name, cols, rows).await,
            ViewerCommand::Rename { pty_id, name } => self.rename(pty_id, name).await,
        }
    }

    /// Drain a command channel until the viewer disconnects, then tear
    /// down every attachment the viewer still holds
    pub async fn run(mut self, mut commands: mpsc::Receiver<ViewerCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        self.teardown().await;
    }

    /// Release everything this viewer holds. Idempotent.
    pub async fn teardown(&mut self) {
        for pty_id in std::mem::take(&mut self.attached) {
            self.release_attachment(&pty_id).await;
        }
        tracing::debug!("Viewer {} released its attachments", self.viewer_id);
    }

    async fn list_remote(&self) {
        self.registry.refresh_all().await;
        // Give agents a moment to answer before reading the snapshot.
        tokio::time::sleep(self.list_refresh_wait).await;
        let ptys = self.registry.all_remote_ptys();
        tracing::debug!(
            "Listing {} remote ptys across {} agents",
            ptys.len(),
            self.registry.len()
        );
        self.emit(ViewerEvent::RemoteList { ptys }).await;
    }

    async fn attach(&mut self, pty_id: String) {
        let Some((agent_id, local_id)) = split_pty_id(&pty_id) else {
            self.emit_malformed(&pty_id).await;
            return;
        };
        if self.registry.agent(agent_id).is_none() {
            self.emit(ViewerEvent::Error {
                message: format!("No connected agent for {}", pty_id),
            })
            .await;
            return;
        }

        // Re-attaching releases the old attachment first so the
        // registry refcount stays balanced even if a visibility revoke
        // cleared it behind our back.
        if self.attached.contains(&pty_id) {
            self.release_attachment(&pty_id).await;
        }

        self.registry
            .subscribe_output(&pty_id, self.viewer_id, self.events.clone());
        self.registry
            .subscribe_visibility(&pty_id, self.viewer_id, self.events.clone());
        self.attached.insert(pty_id.clone());
        if self.registry.record_attach(agent_id, local_id) {
            self.send_to_agent(
                agent_id,
                AgentCommand::Attach {
                    pty_id: local_id.to_string(),
                },
            )
            .await;
        }
        self.emit(ViewerEvent::Attached { pty_id }).await;
    }

    async fn detach(&mut self, pty_id: String) {
        if !self.attached.remove(&pty_id) {
            return;
        }
        self.release_attachment(&pty_id).await;
        self.emit(ViewerEvent::Detached { pty_id }).await;
    }

    async fn input(&self, pty_id: String, data: Bytes) {
        let Some((agent_id, local_id)) = split_pty_id(&pty_id) else {
            tracing::debug!("Dropping input for malformed id {}", pty_id);
            return;
        };
        self.send_to_agent(
            agent_id,
            AgentCommand::Input {
                pty_id: local_id.to_string(),
                data,
            },
        )
        .await;
    }

    async fn resize(&self, pty_id: String, cols: u16, rows: u16) {
        let Some((agent_id, local_id)) = split_pty_id(&pty_id) else {
            tracing::debug!("Dropping resize for malformed id {}", pty_id);
            return;
        };
        self.send_to_agent(
            agent_id,
            AgentCommand::Resize {
                pty_id: local_id.to_string(),
                cols,
                rows,
            },
        )
        .await;
    }

    async fn close(&mut self, pty_id: String) {
        let Some((agent_id, local_id)) = split_pty_id(&pty_id) else {
            self.emit_malformed(&pty_id).await;
            return;
        };
        self.attached.remove(&pty_id);
        self.registry.unsubscribe_output_all(&pty_id);
        self.registry.unsubscribe_visibility_all(&pty_id);
        self.registry.clear_attach(agent_id, local_id);
        self.send_to_agent(
            agent_id,
            AgentCommand::Close {
                pty_id: local_id.to_string(),
            },
        )
        .await;
        self.emit(ViewerEvent::Closed { pty_id }).await;
    }

    async fn create(&self, agent_id: String, name: Option<String>, cols: u16, rows: u16) {
        let Some(handle) = self.registry.agent(&agent_id) else {
            self.emit(ViewerEvent::Error {
                message: format!("Agent {} is not connected", agent_id),
            })
            .await;
            return;
        };

        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = AgentCommand::Create {
            request_id,
            name,
            cols,
            rows,
            reply: reply_tx,
        };
        if handle.commands.send(command).await.is_err() {
            self.emit(ViewerEvent::Error {
                message: format!("Agent {} went away before the request was queued", agent_id),
            })
            .await;
            return;
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(Ok(mut pty))) => {
                pty.id = full_pty_id(&agent_id, &pty.id);
                self.emit(ViewerEvent::Created { pty }).await;
            }
            Ok(Ok(Err(message))) => self.emit(ViewerEvent::Error { message }).await,
            Ok(Err(_)) => {
                self.emit(ViewerEvent::Error {
                    message: format!("Agent {} disconnected before answering", agent_id),
                })
                .await
            }
            Err(_) => {
                self.emit(ViewerEvent::Error {
                    message: format!("Timed out waiting for agent {}", agent_id),
                })
                .await
            }
        }
    }

    async fn rename(&self, pty_id: String, name: String) {
        let Some((agent_id, local_id)) = split_pty_id(&pty_id) else {
            self.emit_malformed(&pty_id).await;
            return;
        };
        let Some(handle) = self.registry.agent(agent_id) else {
            self.emit(ViewerEvent::Error {
                message: format!("No connected agent for {}", pty_id),
            })
            .await;
            return;
        };

        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = AgentCommand::Rename {
            request_id,
            pty_id: local_id.to_string(),
            name: name.clone(),
            reply: reply_tx,
        };
        if handle.commands.send(command).await.is_err() {
            self.emit(ViewerEvent::Error {
                message: format!("Agent {} went away before the request was queued", agent_id),
            })
            .await;
            return;
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(Ok(()))) => self.emit(ViewerEvent::Renamed { pty_id, name }).await,
            Ok(Ok(Err(message))) => self.emit(ViewerEvent::Error { message }).await,
            Ok(Err(_)) => {
                self.emit(ViewerEvent::Error {
                    message: format!("Agent {} disconnected before answering", agent_id),
                })
                .await
            }
            Err(_) => {
                self.emit(ViewerEvent::Error {
                    message: format!("Timed out waiting for agent {}", agent_id),
                })
                .await
            }
        }
    }

    /// Drop subscriptions and the refcount share for one attachment,
    /// telling the agent to stop forwarding if this was the last viewer
    async fn release_attachment(&self, pty_id: &str) {
        let Some((agent_id, local_id)) = split_pty_id(pty_id) else {
            return;
        };
        self.registry.unsubscribe_output(pty_id, self.viewer_id);
        self.registry.unsubscribe_visibility(pty_id, self.viewer_id);
        if self.registry.remove_attach(agent_id, local_id) {
            self.send_to_agent(
                agent_id,
                AgentCommand::Detach {
                    pty_id: local_id.to_string(),
                },
            )
            .await;
        }
    }

    async fn send_to_agent(&self, agent_id: &str, command: AgentCommand) {
        match self.registry.agent(agent_id) {
            Some(handle) => {
                if handle.commands.send(command).await.is_err() {
                    tracing::debug!("Agent {} went away before the command was queued", agent_id);
                }
            }
            None => tracing::debug!("Dropping command for unknown agent {}", agent_id),
        }
    }

    async fn emit_malformed(&self, pty_id: &str) {
        self.emit(ViewerEvent::Error {
            message: format!("Malformed terminal id {}", pty_id),
        })
        .await;
    }

    async fn emit(&self, event: ViewerEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Viewer {} event channel is closed", self.viewer_id);
        }
    }
}
