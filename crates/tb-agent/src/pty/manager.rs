//! PTY inventory
//!
//! Owns every live session on this machine. Sessions are keyed by their
//! generated id and shared out as `Arc<PtySession>`; the manager itself
//! is shared between the relay connection and the binary.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use tb_core::config::AgentConfig;
use tb_core::ProcessError;
use tb_protocol::PtyInfo;

use super::session::{PtySession, SessionSpec};

/// Base name used when a create request does not name the terminal
const DEFAULT_REMOTE_NAME: &str = "term";

/// Collision suffixes tried before falling back to a timestamp
const MAX_NAME_SUFFIX: u32 = 10_000;

/// Capacity of the created-session broadcast
const CREATED_EVENTS_CAPACITY: usize = 32;

/// Creates, tracks and closes PTY sessions
pub struct PtyManager {
    sessions: DashMap<String, Arc<PtySession>>,
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_directory: PathBuf,
    history_limit: usize,
    remote_create_enabled: AtomicBool,
    created_tx: broadcast::Sender<Arc<PtySession>>,
}

impl PtyManager {
    pub fn new(config: &AgentConfig) -> Self {
        let (command, args) = config.shell_command();
        let (created_tx, _) = broadcast::channel(CREATED_EVENTS_CAPACITY);
        Self {
            sessions: DashMap::new(),
            command,
            args,
            env: config.default_env.clone(),
            working_directory: config.resolved_working_directory(),
            history_limit: config.history_limit,
            remote_create_enabled: AtomicBool::new(config.remote_create_enabled),
            created_tx,
        }
    }

    /// Spawn a new session running the configured shell
    pub fn create(
        &self,
        name: impl Into<String>,
        remote_viewable: bool,
        remote_created: bool,
    ) -> Result<Arc<PtySession>, ProcessError> {
        let id = Uuid::new_v4().to_string();
        let name = name.into();
        let session = PtySession::spawn(SessionSpec {
            id: id.clone(),
            name: name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            working_directory: self.working_directory.clone(),
            history_limit: self.history_limit,
            remote_viewable,
            remote_created,
        })?;
        self.sessions.insert(id.clone(), Arc::clone(&session));
        tracing::info!("Created PTY {} ({})", id, name);
        let _ = self.created_tx.send(Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Close and drop a session. Unknown ids are a no-op.
    pub async fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub fn get_all(&self) -> Vec<Arc<PtySession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Inventory of remote-viewable sessions, as reported to the relay
    pub async fn remote_viewable_infos(&self) -> Vec<PtyInfo> {
        let mut infos = Vec::new();
        for session in self.get_all() {
            if session.is_remote_viewable() {
                infos.push(session.info().await);
            }
        }
        infos
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id).await;
        }
    }

    /// Broadcast of sessions created after the subscription
    pub fn created_events(&self) -> broadcast::Receiver<Arc<PtySession>> {
        self.created_tx.subscribe()
    }

    pub fn remote_create_enabled(&self) -> bool {
        self.remote_create_enabled.load(Ordering::Relaxed)
    }

    pub fn set_remote_create_enabled(&self, enabled: bool) {
        self.remote_create_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Derive a unique display name for a remote-created terminal.
    /// The base defaults to `term` and is always prefixed with the agent
    /// identity so viewers can tell machines apart.
    pub async fn unique_remote_name(&self, agent_id: &str, requested: Option<&str>) -> String {
        let base = requested
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_REMOTE_NAME);
        let candidate = format!("{}-{}", agent_id, base);

        let mut existing = HashSet::new();
        for session in self.get_all() {
            existing.insert(session.name().await);
        }
        pick_unique_name(&existing, candidate)
    }
}

/// First free variant of `candidate`: the name itself, then `-2`, `-3`, …
/// up to a bound, then a timestamp suffix.
fn pick_unique_name(existing: &HashSet<String>, candidate: String) -> String {
    if !existing.contains(&candidate) {
        return candidate;
    }
    for n in 2..=MAX_NAME_SUFFIX {
        let attempt = format!("{}-{}", candidate, n);
        if !existing.contains(&attempt) {
            return attempt;
        }
    }
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}-{}", candidate, stamp)
}
