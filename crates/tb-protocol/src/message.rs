//! Message types for the termbridge protocol
//!
//! This module defines the high-level messages exchanged between agents
//! and the relay. Messages are bincode-serialized into frame payloads;
//! post-handshake payloads pass through the AEAD layer first.
//!
//! # Message Flow
//!
//! Typical sequence for one agent connection:
//!
//! 1. Agent sends `AuthRequest`, relay answers `AuthResponse`
//! 2. Agent sends `AuthFinish`, relay answers `AuthResult`
//!    (`DuplicateAgentId` restarts from step 1 with a suffixed identity)
//! 3. Relay pulls inventory with `PtyListRequest` / `PtyListResponse`
//! 4. Viewers drive `PtyAttach` / `PtyInput` / `PtyResize` / `PtyDetach`;
//!    the agent streams `PtyOutput`
//! 5. `Heartbeat` flows agent → relay every 30 seconds; the relay echoes
//! 6. `PtyVisibilityChanged { visible: false }` revokes a shared PTY

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

/// Snapshot of one PTY as reported by its agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyInfo {
    /// Agent-local PTY id
    pub id: String,
    /// Display name
    pub name: String,
    /// Whether the child process is still running
    pub alive: bool,
    /// Whether the agent shares this PTY with remote viewers
    pub remote_viewable: bool,
    /// Whether the PTY was created on behalf of the relay
    pub remote_created: bool,
}

/// Verdict carried by `AuthResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthOutcome {
    /// Handshake complete, identity registered
    Ok,
    /// Identity already registered by a live connection; retry suffixed
    DuplicateAgentId,
    /// Request MAC did not verify; terminal rejection
    InvalidAuth,
}

impl AuthOutcome {
    /// Stable wire/transcript name for this outcome
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::DuplicateAgentId => "DUPLICATE_AGENT_ID",
            Self::InvalidAuth => "INVALID_AUTH",
        }
    }
}

impl fmt::Display for AuthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message kind identifier, used for logging and dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    AuthRequest,
    AuthResponse,
    AuthFinish,
    AuthResult,
    PtyListRequest,
    PtyListResponse,
    PtyOutput,
    PtyInput,
    PtyResize,
    PtyClose,
    PtyAttach,
    PtyDetach,
    PtyVisibilityChanged,
    PtyCreate,
    PtyCreateResult,
    PtyRename,
    PtyRenameResult,
    Heartbeat,
}

impl MessageKind {
    /// Stable name for logs and MAC transcripts
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequest => "AUTH_REQUEST",
            Self::AuthResponse => "AUTH_RESPONSE",
            Self::AuthFinish => "AUTH_FINISH",
            Self::AuthResult => "AUTH_RESULT",
            Self::PtyListRequest => "PTY_LIST_REQUEST",
            Self::PtyListResponse => "PTY_LIST_RESPONSE",
            Self::PtyOutput => "PTY_OUTPUT",
            Self::PtyInput => "PTY_INPUT",
            Self::PtyResize => "PTY_RESIZE",
            Self::PtyClose => "PTY_CLOSE",
            Self::PtyAttach => "PTY_ATTACH",
            Self::PtyDetach => "PTY_DETACH",
            Self::PtyVisibilityChanged => "PTY_VISIBILITY_CHANGED",
            Self::PtyCreate => "PTY_CREATE",
            Self::PtyCreateResult => "PTY_CREATE_RESULT",
            Self::PtyRename => "PTY_RENAME",
            Self::PtyRenameResult => "PTY_RENAME_RESULT",
            Self::Heartbeat => "HEARTBEAT",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Handshake step 1 (agent → relay).
    ///
    /// Carries the agent's claimed identity, a fresh X25519 public key and
    /// a fresh 32-byte nonce, MACed with the pre-shared key.
    AuthRequest {
        agent_id: String,
        public_key: [u8; 32],
        nonce: [u8; 32],
        mac: Vec<u8>,
    },

    /// Handshake step 2 (relay → agent), MACed with the pre-shared key
    AuthResponse {
        public_key: [u8; 32],
        nonce: [u8; 32],
        mac: Vec<u8>,
    },

    /// Handshake step 3 (agent → relay), MACed with the derived session
    /// key to prove both sides agree on it
    AuthFinish { agent_id: String, mac: Vec<u8> },

    /// Handshake step 4 (relay → agent).
    ///
    /// `Ok` and `DuplicateAgentId` are MACed with the session key;
    /// `InvalidAuth` predates any key agreement and carries an empty MAC.
    AuthResult { outcome: AuthOutcome, mac: Vec<u8> },

    /// Ask the agent for its current PTY inventory
    PtyListRequest,

    /// Inventory answer; contains only remote-viewable PTYs
    PtyListResponse { ptys: Vec<PtyInfo> },

    /// Output chunk from a PTY (agent → relay)
    PtyOutput { pty_id: String, data: Bytes },

    /// Keyboard/paste input for a PTY (relay → agent)
    PtyInput { pty_id: String, data: Bytes },

    /// Resize the PTY's live process
    PtyResize { pty_id: String, cols: u16, rows: u16 },

    /// Close a PTY and its child process
    PtyClose { pty_id: String },

    /// Start forwarding output for this PTY
    PtyAttach { pty_id: String },

    /// Stop forwarding output for this PTY
    PtyDetach { pty_id: String },

    /// The agent stopped (or resumed) sharing a PTY
    PtyVisibilityChanged { pty_id: String, visible: bool },

    /// Create a new PTY on the agent (relay → agent)
    PtyCreate {
        request_id: String,
        /// Requested base name; the agent derives a unique full name
        name: Option<String>,
        cols: u16,
        rows: u16,
    },

    /// Answer to `PtyCreate`, correlated by request id
    PtyCreateResult {
        request_id: String,
        result: Result<PtyInfo, String>,
    },

    /// Rename a remote-viewable PTY
    PtyRename {
        request_id: String,
        pty_id: String,
        name: String,
    },

    /// Answer to `PtyRename`, correlated by request id
    PtyRenameResult {
        request_id: String,
        result: Result<(), String>,
    },

    /// Liveness ping (agent → relay, echoed back by the relay)
    Heartbeat,
}

impl Message {
    /// Get the kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::AuthRequest { .. } => MessageKind::AuthRequest,
            Message::AuthResponse { .. } => MessageKind::AuthResponse,
            Message::AuthFinish { .. } => MessageKind::AuthFinish,
            Message::AuthResult { .. } => MessageKind::AuthResult,
            Message::PtyListRequest => MessageKind::PtyListRequest,
            Message::PtyListResponse { .. } => MessageKind::PtyListResponse,
            Message::PtyOutput { .. } => MessageKind::PtyOutput,
            Message::PtyInput { .. } => MessageKind::PtyInput,
            Message::PtyResize { .. } => MessageKind::PtyResize,
            Message::PtyClose { .. } => MessageKind::PtyClose,
            Message::PtyAttach { .. } => MessageKind::PtyAttach,
            Message::PtyDetach { .. } => MessageKind::PtyDetach,
            Message::PtyVisibilityChanged { .. } => MessageKind::PtyVisibilityChanged,
            Message::PtyCreate { .. } => MessageKind::PtyCreate,
            Message::PtyCreateResult { .. } => MessageKind::PtyCreateResult,
            Message::PtyRename { .. } => MessageKind::PtyRename,
            Message::PtyRenameResult { .. } => MessageKind::PtyRenameResult,
            Message::Heartbeat => MessageKind::Heartbeat,
        }
    }

    /// Whether this message belongs to the plaintext handshake phase
    pub fn is_handshake(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::AuthRequest
                | MessageKind::AuthResponse
                | MessageKind::AuthFinish
                | MessageKind::AuthResult
        )
    }

    /// Serialize into a frame payload
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from a frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::PtyOutput {
            pty_id: "abc123".to_string(),
            data: Bytes::from_static(b"ls -la\r\n"),
        };

        let payload = msg.encode().unwrap();
        let decoded = Message::decode(&payload).unwrap();

        match decoded {
            Message::PtyOutput { pty_id, data } => {
                assert_eq!(pty_id, "abc123");
                assert_eq!(data.as_ref(), b"ls -la\r\n");
            }
            other => panic!("Expected PtyOutput, got {}", other.kind()),
        }
    }

    #[test]
    fn test_auth_request_roundtrip() {
        let msg = Message::AuthRequest {
            agent_id: "my-host".to_string(),
            public_key: [7u8; 32],
            nonce: [9u8; 32],
            mac: vec![1, 2, 3],
        };

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::AuthRequest {
                agent_id,
                public_key,
                nonce,
                mac,
            } => {
                assert_eq!(agent_id, "my-host");
                assert_eq!(public_key, [7u8; 32]);
                assert_eq!(nonce, [9u8; 32]);
                assert_eq!(mac, vec![1, 2, 3]);
            }
            other => panic!("Expected AuthRequest, got {}", other.kind()),
        }
    }

    #[test]
    fn test_create_result_carries_error() {
        let msg = Message::PtyCreateResult {
            request_id: "req-1".to_string(),
            result: Err("remote create is disabled".to_string()),
        };

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::PtyCreateResult { request_id, result } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(result.unwrap_err(), "remote create is disabled");
            }
            other => panic!("Expected PtyCreateResult, got {}", other.kind()),
        }
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(MessageKind::AuthRequest.as_str(), "AUTH_REQUEST");
        assert_eq!(MessageKind::PtyVisibilityChanged.as_str(), "PTY_VISIBILITY_CHANGED");
        assert_eq!(MessageKind::Heartbeat.as_str(), "HEARTBEAT");
        assert_eq!(AuthOutcome::DuplicateAgentId.as_str(), "DUPLICATE_AGENT_ID");
    }

    #[test]
    fn test_handshake_classification() {
        assert!(Message::AuthRequest {
            agent_id: String::new(),
            public_key: [0; 32],
            nonce: [0; 32],
            mac: vec![],
        }
        .is_handshake());
        assert!(Message::AuthResult {
            outcome: AuthOutcome::Ok,
            mac: vec![],
        }
        .is_handshake());
        assert!(!Message::Heartbeat.is_handshake());
        assert!(!Message::PtyListRequest.is_handshake());
    }
}
