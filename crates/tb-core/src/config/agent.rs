//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::agent_id;

/// Configuration for the dial-out agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Relay address to connect to (`host:port`)
    pub relay_address: String,

    /// Pre-shared key; must match the relay's
    pub preshared_key: String,

    /// Agent identity. None derives one from `$TERMBRIDGE_AGENT_ID`,
    /// the hostname or the username.
    pub agent_id: Option<String>,

    /// Shell to spawn in new PTYs (None = platform default)
    pub shell: Option<String>,

    /// Arguments passed to a configured shell
    pub shell_args: Vec<String>,

    /// Working directory for new PTYs (None = home directory)
    pub working_directory: Option<PathBuf>,

    /// Environment variables set in every PTY
    pub default_env: Vec<(String, String)>,

    /// Delay between reconnect attempts
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Heartbeat interval while authenticated
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Output history retained per PTY, in bytes
    pub history_limit: usize,

    /// Whether the relay may create PTYs on this agent
    pub remote_create_enabled: bool,

    /// Suffixed identities tried per connection before giving up
    pub max_identity_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_address: "localhost:9090".to_string(),
            preshared_key: "123456".to_string(),
            agent_id: None,
            shell: None,
            shell_args: vec![],
            working_directory: None,
            default_env: vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("LANG".to_string(), "en_US.UTF-8".to_string()),
                ("LC_ALL".to_string(), "en_US.UTF-8".to_string()),
            ],
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            history_limit: 100 * 1024,
            remote_create_enabled: true,
            max_identity_attempts: 10,
        }
    }
}

impl AgentConfig {
    /// Resolve the identity this agent claims on its first attempt
    pub fn resolved_agent_id(&self) -> String {
        match &self.agent_id {
            Some(explicit) if !explicit.trim().is_empty() => agent_id::sanitize(explicit),
            _ => agent_id::default_agent_id(),
        }
    }

    /// The shell command to spawn, falling back to the platform default
    pub fn shell_command(&self) -> (String, Vec<String>) {
        match &self.shell {
            Some(shell) => (shell.clone(), self.shell_args.clone()),
            None => default_shell(),
        }
    }

    /// The working directory for new PTYs, falling back to home
    pub fn resolved_working_directory(&self) -> PathBuf {
        self.working_directory
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn default_shell() -> (String, Vec<String>) {
    if cfg!(target_os = "windows") {
        ("cmd.exe".to_string(), vec![])
    } else if cfg!(target_os = "macos") {
        (
            "/bin/zsh".to_string(),
            vec!["-i".to_string(), "-l".to_string()],
        )
    } else {
        (
            "/bin/bash".to_string(),
            vec!["-i".to_string(), "-l".to_string()],
        )
    }
}
