//! Relay configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the relay daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the agent listener binds to
    pub bind_address: String,

    /// Pre-shared key agents must present
    pub preshared_key: String,

    /// Tear down an agent connection that stays silent this long.
    /// Agents heartbeat every 30 seconds, so the default tolerates two
    /// missed beats.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// How long a remote list refresh waits for agents to answer
    #[serde(with = "duration_millis")]
    pub list_refresh_wait: Duration,

    /// Timeout for remote create/rename round trips
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Command queue capacity per agent connection
    pub command_queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
            preshared_key: "123456".to_string(),
            idle_timeout: Duration::from_secs(90),
            list_refresh_wait: Duration::from_millis(150),
            request_timeout: Duration::from_secs(10),
            command_queue_depth: 256,
        }
    }
}
