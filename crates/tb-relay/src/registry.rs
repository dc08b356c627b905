//! Registry of connected agents and viewer routing state
//!
//! The registry is the relay's single shared-state surface: agent
//! connection handles, attachment refcounts, viewer subscriptions and
//! the last-known PTY inventory per agent. It is injected as an
//! `Arc<AgentRegistry>` into the listener and every bridge; nothing in
//! this module is global.
//!
//! All operations are best-effort and idempotent. Operating on an agent,
//! PTY or subscription that is no longer there is a no-op, never an
//! error; failures worth knowing about are logged.

use std::collections::HashMap;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tb_protocol::PtyInfo;

use crate::bridge::ViewerEvent;

/// Build the relay-wide PTY id `{agent_id}:{pty_id}`.
///
/// Agent ids cannot contain `:` (identity sanitization strips it), so
/// the first colon always terminates the agent part.
pub fn full_pty_id(agent_id: &str, pty_id: &str) -> String {
    format!("{}:{}", agent_id, pty_id)
}

/// Split a relay-wide PTY id back into `(agent_id, pty_id)`
pub fn split_pty_id(full_id: &str) -> Option<(&str, &str)> {
    full_id.split_once(':')
}

/// Commands queued for an agent's connection task
#[derive(Debug)]
pub enum AgentCommand {
    /// Start forwarding output for a PTY
    Attach { pty_id: String },
    /// Stop forwarding output for a PTY
    Detach { pty_id: String },
    /// Deliver input bytes to a PTY
    Input { pty_id: String, data: Bytes },
    /// Resize a PTY's child process
    Resize { pty_id: String, cols: u16, rows: u16 },
    /// Close a PTY and its child process
    Close { pty_id: String },
    /// Ask the agent for its current PTY inventory
    ListPtys,
    /// Create a PTY on the agent and report back over `reply`
    Create {
        request_id: String,
        name: Option<String>,
        cols: u16,
        rows: u16,
        reply: oneshot::Sender<Result<PtyInfo, String>>,
    },
    /// Rename a PTY on the agent and report back over `reply`
    Rename {
        request_id: String,
        pty_id: String,
        name: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Handle to one live agent connection
#[derive(Debug, Clone)]
pub struct AgentHandle {
    /// Command queue drained by the connection task
    pub commands: mpsc::Sender<AgentCommand>,
    /// Cancels the connection task
    pub cancel: CancellationToken,
    /// Distinguishes this connection from a reconnected successor
    pub connection_id: Uuid,
}

/// Shared relay state, keyed by agent id and relay-wide PTY id
pub struct AgentRegistry {
    /// Live agent connections
    agents: DashMap<String, AgentHandle>,
    /// Viewer refcount per attached PTY, keyed by full id.
    /// Entries survive agent disconnects so a reconnecting agent can be
    /// re-attached without viewer involvement.
    attachments: DashMap<String, usize>,
    /// Output subscribers per full id, keyed by viewer id
    output_subs: DashMap<String, HashMap<Uuid, mpsc::Sender<ViewerEvent>>>,
    /// Visibility subscribers per full id, keyed by viewer id
    visibility_subs: DashMap<String, HashMap<Uuid, mpsc::Sender<ViewerEvent>>>,
    /// Last-known PTY inventory per agent, agent-local ids
    ptys: DashMap<String, Vec<PtyInfo>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            attachments: DashMap::new(),
            output_subs: DashMap::new(),
            visibility_subs: DashMap::new(),
            ptys: DashMap::new(),
        }
    }

    /// Register an agent connection if the id is free.
    ///
    /// On success, recorded attachments for this agent id are replayed
    /// as `Attach` commands so forwarding resumes after a reconnect
    /// without any viewer action. Returns `false` when a live connection
    /// already holds the id; the caller should answer the handshake with
    /// a duplicate verdict.
    pub fn try_register(&self, agent_id: &str, handle: AgentHandle) -> bool {
        let commands = handle.commands.clone();
        match self.agents.entry(agent_id.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }

        for pty_id in self.attached_ptys(agent_id) {
            match commands.try_send(AgentCommand::Attach {
                pty_id: pty_id.clone(),
            }) {
                Ok(()) => tracing::debug!("Replayed attach for {}:{}", agent_id, pty_id),
                Err(e) => tracing::warn!(
                    "Could not replay attach for {}:{}: {}",
                    agent_id,
                    pty_id,
                    e
                ),
            }
        }
        true
    }

    /// Remove an agent, but only if `connection_id` still matches.
    ///
    /// A connection that was replaced by a successor must not tear the
    /// successor down during its own cleanup. Attachment records are
    /// kept either way; the cached inventory goes with the agent.
    pub fn unregister(&self, agent_id: &str, connection_id: Uuid) -> bool {
        let removed = self
            .agents
            .remove_if(agent_id, |_, handle| handle.connection_id == connection_id)
            .is_some();
        if removed {
            self.ptys.remove(agent_id);
        }
        removed
    }

    /// Look up a live agent's handle
    pub fn agent(&self, agent_id: &str) -> Option<AgentHandle> {
        self.agents.get(agent_id).map(|h| h.value().clone())
    }

    /// Ids of all live agents
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether any agent is connected
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agent-local ids of every PTY with a recorded attachment for this agent
    fn attached_ptys(&self, agent_id: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for entry in self.attachments.iter() {
            if let Some((agent, pty)) = split_pty_id(entry.key()) {
                if agent == agent_id && *entry.value() > 0 {
                    ids.push(pty.to_string());
                }
            }
        }
        ids
    }

    /// Count one more viewer on a PTY. Returns `true` on the 0 -> 1
    /// transition, which is the caller's cue to send `PTY_ATTACH`
    /// upstream.
    pub fn record_attach(&self, agent_id: &str, pty_id: &str) -> bool {
        let mut count = self
            .attachments
            .entry(full_pty_id(agent_id, pty_id))
            .or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Count one viewer off a PTY. Returns `true` when the count reaches
    /// zero, which is the caller's cue to send `PTY_DETACH` upstream.
    pub fn remove_attach(&self, agent_id: &str, pty_id: &str) -> bool {
        let full_id = full_pty_id(agent_id, pty_id);
        let mut last = false;
        if let Some(mut count) = self.attachments.get_mut(&full_id) {
            *count = count.saturating_sub(1);
            last = *count == 0;
        }
        if last {
            self.attachments.remove_if(&full_id, |_, count| *count == 0);
        }
        last
    }

    /// Drop the attachment record for a PTY outright, whatever its count
    pub fn clear_attach(&self, agent_id: &str, pty_id: &str) {
        self.attachments.remove(&full_pty_id(agent_id, pty_id));
    }

    /// Register a viewer's output sink for a PTY. Subscribing twice
    /// under the same viewer id replaces the previous sink.
    pub fn subscribe_output(&self, full_id: &str, viewer_id: Uuid, tx: mpsc::Sender<ViewerEvent>) {
        self.output_subs
            .entry(full_id.to_string())
            .or_default()
            .insert(viewer_id, tx);
    }

    /// Drop one viewer's output subscription
    pub fn unsubscribe_output(&self, full_id: &str, viewer_id: Uuid) {
        let mut empty = false;
        if let Some(mut subs) = self.output_subs.get_mut(full_id) {
            subs.remove(&viewer_id);
            empty = subs.is_empty();
        }
        if empty {
            self.output_subs.remove_if(full_id, |_, subs| subs.is_empty());
        }
    }

    /// Drop every output subscription for a PTY
    pub fn unsubscribe_output_all(&self, full_id: &str) {
        self.output_subs.remove(full_id);
    }

    /// Register a viewer's visibility sink for a PTY
    pub fn subscribe_visibility(
        &self,
        full_id: &str,
        viewer_id: Uuid,
        tx: mpsc::Sender<ViewerEvent>,
    ) {
        self.visibility_subs
            .entry(full_id.to_string())
            .or_default()
            .insert(viewer_id, tx);
    }

    /// Drop one viewer's visibility subscription
    pub fn unsubscribe_visibility(&self, full_id: &str, viewer_id: Uuid) {
        let mut empty = false;
        if let Some(mut subs) = self.visibility_subs.get_mut(full_id) {
            subs.remove(&viewer_id);
            empty = subs.is_empty();
        }
        if empty {
            self.visibility_subs
                .remove_if(full_id, |_, subs| subs.is_empty());
        }
    }

    /// Drop every visibility subscription for a PTY without notifying
    pub fn unsubscribe_visibility_all(&self, full_id: &str) {
        self.visibility_subs.remove(full_id);
    }

    /// Fan an output chunk out to every subscriber of the PTY.
    ///
    /// Sends are non-blocking: a viewer with a full queue loses this
    /// chunk but keeps its subscription, and a viewer whose channel is
    /// gone is pruned. One slow viewer never stalls the rest.
    pub fn forward_output(&self, agent_id: &str, pty_id: &str, data: Bytes) {
        let full_id = full_pty_id(agent_id, pty_id);
        let Some(mut subs) = self.output_subs.get_mut(&full_id) else {
            return;
        };
        subs.retain(|viewer_id, tx| {
            match tx.try_send(ViewerEvent::Output {
                pty_id: full_id.clone(),
                data: data.clone(),
            }) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        "Viewer {} is lagging; dropped {} bytes for {}",
                        viewer_id,
                        data.len(),
                        full_id
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Notify and drain the visibility subscribers of a PTY. One-shot:
    /// the subscriber set is consumed.
    pub fn notify_visibility_disabled(&self, full_id: &str) {
        let Some((_, subs)) = self.visibility_subs.remove(full_id) else {
            return;
        };
        for (viewer_id, tx) in subs {
            let event = ViewerEvent::VisibilityDisabled {
                pty_id: full_id.to_string(),
            };
            if tx.try_send(event).is_err() {
                tracing::debug!("Viewer {} missed the visibility notice for {}", viewer_id, full_id);
            }
        }
    }

    /// An agent revoked remote viewing of a PTY: drop its output
    /// subscriptions and attachment record, then fire the one-shot
    /// visibility notices.
    pub fn visibility_disabled(&self, agent_id: &str, pty_id: &str) {
        let full_id = full_pty_id(agent_id, pty_id);
        self.unsubscribe_output_all(&full_id);
        self.clear_attach(agent_id, pty_id);
        self.notify_visibility_disabled(&full_id);
    }

    /// Replace the cached inventory for an agent
    pub fn update_pty_list(&self, agent_id: &str, infos: Vec<PtyInfo>) {
        self.ptys.insert(agent_id.to_string(), infos);
    }

    /// Insert or update a single PTY in an agent's cached inventory
    pub fn upsert_pty(&self, agent_id: &str, info: PtyInfo) {
        let mut list = self.ptys.entry(agent_id.to_string()).or_default();
        match list.iter_mut().find(|p| p.id == info.id) {
            Some(existing) => *existing = info,
            None => list.push(info),
        }
    }

    /// Apply a rename to the cached inventory
    pub fn rename_pty(&self, agent_id: &str, pty_id: &str, name: &str) {
        if let Some(mut list) = self.ptys.get_mut(agent_id) {
            if let Some(info) = list.iter_mut().find(|p| p.id == pty_id) {
                info.name = name.to_string();
            }
        }
    }

    /// Cached inventory across all agents, rewritten to relay-wide ids
    /// and sorted for a stable listing
    pub fn all_remote_ptys(&self) -> Vec<PtyInfo> {
        let mut out = Vec::new();
        for entry in self.ptys.iter() {
            for info in entry.value() {
                let mut info = info.clone();
                info.id = full_pty_id(entry.key(), &info.id);
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Queue an inventory request to every live agent
    pub async fn refresh_all(&self) {
        let agents: Vec<(String, mpsc::Sender<AgentCommand>)> = self
            .agents
            .iter()
            .map(|e| (e.key().clone(), e.value().commands.clone()))
            .collect();
        for (agent_id, commands) in agents {
            if commands.send(AgentCommand::ListPtys).await.is_err() {
                tracing::debug!("Agent {} command queue is closed", agent_id);
            }
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
