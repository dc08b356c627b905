//! PSK-authenticated key agreement
//!
//! Both ends run a small state machine over plaintext frames:
//!
//! 1. initiator → `AuthRequest`  (identity, X25519 key, nonce; PSK MAC)
//! 2. responder → `AuthResponse` (X25519 key, nonce; PSK MAC)
//! 3. initiator → `AuthFinish`   (session-key MAC, proves key agreement)
//! 4. responder → `AuthResult`   (verdict; session-key MAC)
//!
//! Both sides derive the session key after step 2, but nothing is sealed
//! with it until step 4 lands. A `DuplicateAgentId` verdict restarts the
//! exchange on the same connection with fresh key material under a
//! suffixed identity; an `InvalidAuth` verdict is terminal.
//!
//! MAC transcripts join the message kind, the agent identity and the
//! base64-encoded keys/nonces with `|`, in send order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use x25519_dalek::PublicKey;

use crate::crypto::{
    derive_session_key, generate_keypair, generate_nonce, hmac_sha256, verify_hmac_sha256,
    SessionKey, HANDSHAKE_NONCE_SIZE,
};
use crate::message::{AuthOutcome, Message, MessageKind};

/// Errors during the handshake. All of them abort the attempt.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// A MAC did not verify
    #[error("MAC verification failed for {0}")]
    BadMac(MessageKind),

    /// A handshake message arrived in the wrong state
    #[error("Unexpected {got} in handshake state {state}")]
    UnexpectedMessage {
        got: MessageKind,
        state: &'static str,
    },

    /// An operation was invoked in the wrong state
    #[error("{op} is not valid in handshake state {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    /// The responder refused the credentials outright
    #[error("Handshake rejected by peer")]
    Rejected,

    /// Every permitted identity variant was already taken
    #[error("Identity attempts exhausted after {attempts} tries")]
    AttemptsExhausted { attempts: u32 },
}

/// Terminal verdict of an initiator-side handshake
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Both sides hold the same session key; seal everything from now on
    Authenticated(SessionKey),
    /// Identity taken by a live connection; restart under the next suffix
    DuplicateIdentity,
}

fn b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

fn request_transcript(agent_id: &str, public_key: &[u8; 32], nonce: &[u8; 32]) -> String {
    format!(
        "{}|{}|{}|{}",
        MessageKind::AuthRequest,
        agent_id,
        b64(public_key),
        b64(nonce)
    )
}

fn response_transcript(
    agent_id: &str,
    responder_key: &[u8; 32],
    responder_nonce: &[u8; 32],
    initiator_key: &[u8; 32],
    initiator_nonce: &[u8; 32],
) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        MessageKind::AuthResponse,
        agent_id,
        b64(responder_key),
        b64(responder_nonce),
        b64(initiator_key),
        b64(initiator_nonce)
    )
}

fn finish_transcript(agent_id: &str) -> String {
    format!("{}|{}", MessageKind::AuthFinish, agent_id)
}

fn result_transcript(agent_id: &str, outcome: AuthOutcome) -> String {
    format!("{}|{}|{}", MessageKind::AuthResult, agent_id, outcome)
}

enum InitiatorState {
    Idle,
    AwaitingResponse {
        secret: x25519_dalek::StaticSecret,
        public: PublicKey,
        nonce: [u8; HANDSHAKE_NONCE_SIZE],
    },
    AwaitingResult {
        session_key: SessionKey,
    },
    Done,
}

impl InitiatorState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingResponse { .. } => "awaiting-response",
            Self::AwaitingResult { .. } => "awaiting-result",
            Self::Done => "done",
        }
    }
}

/// Agent-side handshake state machine. Pure; the caller moves messages.
pub struct InitiatorHandshake {
    psk: Vec<u8>,
    agent_id: String,
    state: InitiatorState,
}

impl InitiatorHandshake {
    /// Create a fresh initiator for the given identity
    pub fn new(psk: impl Into<Vec<u8>>, agent_id: impl Into<String>) -> Self {
        Self {
            psk: psk.into(),
            agent_id: agent_id.into(),
            state: InitiatorState::Idle,
        }
    }

    /// The identity currently being claimed
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Begin (or restart) the exchange. Generates a fresh keypair and
    /// nonce every call and returns the `AuthRequest` to send.
    pub fn start(&mut self) -> Message {
        let (secret, public) = generate_keypair();
        let nonce = generate_nonce();

        let transcript = request_transcript(&self.agent_id, public.as_bytes(), &nonce);
        let mac = hmac_sha256(&self.psk, transcript.as_bytes());

        let message = Message::AuthRequest {
            agent_id: self.agent_id.clone(),
            public_key: *public.as_bytes(),
            nonce,
            mac,
        };
        self.state = InitiatorState::AwaitingResponse {
            secret,
            public,
            nonce,
        };
        message
    }

    /// Restart under a different identity after a duplicate verdict
    pub fn restart_as(&mut self, agent_id: impl Into<String>) -> Message {
        self.agent_id = agent_id.into();
        self.start()
    }

    /// Handle `AuthResponse`: verify the responder MAC, derive the session
    /// key and return the `AuthFinish` to send.
    pub fn on_response(
        &mut self,
        public_key: &[u8; 32],
        nonce: &[u8; HANDSHAKE_NONCE_SIZE],
        mac: &[u8],
    ) -> Result<Message, HandshakeError> {
        let (secret, our_public, our_nonce) =
            match std::mem::replace(&mut self.state, InitiatorState::Idle) {
                InitiatorState::AwaitingResponse {
                    secret,
                    public,
                    nonce,
                } => (secret, public, nonce),
                other => {
                    let state = other.name();
                    self.state = other;
                    return Err(HandshakeError::UnexpectedMessage {
                        got: MessageKind::AuthResponse,
                        state,
                    });
                }
            };

        let transcript = response_transcript(
            &self.agent_id,
            public_key,
            nonce,
            our_public.as_bytes(),
            &our_nonce,
        );
        if !verify_hmac_sha256(&self.psk, transcript.as_bytes(), mac) {
            return Err(HandshakeError::BadMac(MessageKind::AuthResponse));
        }

        let shared = secret.diffie_hellman(&PublicKey::from(*public_key));
        let session_key = derive_session_key(&self.psk, shared.as_bytes(), &our_nonce, nonce);

        let finish_mac = hmac_sha256(
            session_key.as_bytes(),
            finish_transcript(&self.agent_id).as_bytes(),
        );
        let message = Message::AuthFinish {
            agent_id: self.agent_id.clone(),
            mac: finish_mac,
        };
        self.state = InitiatorState::AwaitingResult { session_key };
        Ok(message)
    }

    /// Handle `AuthResult`. On `DuplicateIdentity` the caller picks the
    /// next identity and calls `restart_as`.
    pub fn on_result(
        &mut self,
        outcome: AuthOutcome,
        mac: &[u8],
    ) -> Result<HandshakeOutcome, HandshakeError> {
        if outcome == AuthOutcome::InvalidAuth {
            // The responder could not verify our request; no session key
            // exists on either side, so there is no MAC to check.
            self.state = InitiatorState::Idle;
            return Err(HandshakeError::Rejected);
        }

        let session_key = match std::mem::replace(&mut self.state, InitiatorState::Idle) {
            InitiatorState::AwaitingResult { session_key } => session_key,
            other => {
                let state = other.name();
                self.state = other;
                return Err(HandshakeError::UnexpectedMessage {
                    got: MessageKind::AuthResult,
                    state,
                });
            }
        };

        let transcript = result_transcript(&self.agent_id, outcome);
        if !verify_hmac_sha256(session_key.as_bytes(), transcript.as_bytes(), mac) {
            return Err(HandshakeError::BadMac(MessageKind::AuthResult));
        }

        match outcome {
            AuthOutcome::Ok => {
                self.state = InitiatorState::Done;
                Ok(HandshakeOutcome::Authenticated(session_key))
            }
            // InvalidAuth returned early above
            _ => Ok(HandshakeOutcome::DuplicateIdentity),
        }
    }
}

enum ResponderState {
    AwaitingRequest,
    AwaitingFinish {
        agent_id: String,
        session_key: SessionKey,
    },
    Verified {
        agent_id: String,
        session_key: SessionKey,
    },
    Done,
}

impl ResponderState {
    fn name(&self) -> &'static str {
        match self {
            Self::AwaitingRequest => "awaiting-request",
            Self::AwaitingFinish { .. } => "awaiting-finish",
            Self::Verified { .. } => "verified",
            Self::Done => "done",
        }
    }
}

/// Relay-side handshake state machine. Pure; the caller moves messages.
pub struct ResponderHandshake {
    psk: Vec<u8>,
    state: ResponderState,
}

impl ResponderHandshake {
    /// Create a fresh responder
    pub fn new(psk: impl Into<Vec<u8>>) -> Self {
        Self {
            psk: psk.into(),
            state: ResponderState::AwaitingRequest,
        }
    }

    /// The rejection sent when a request MAC cannot be verified. Carries
    /// no MAC: there is no shared key at that point.
    pub fn rejection() -> Message {
        Message::AuthResult {
            outcome: AuthOutcome::InvalidAuth,
            mac: Vec::new(),
        }
    }

    /// Handle `AuthRequest`: verify the initiator MAC, derive the session
    /// key and return the `AuthResponse` to send. On `BadMac` the caller
    /// sends `Self::rejection()` and drops the connection.
    pub fn on_request(
        &mut self,
        agent_id: &str,
        public_key: &[u8; 32],
        nonce: &[u8; HANDSHAKE_NONCE_SIZE],
        mac: &[u8],
    ) -> Result<Message, HandshakeError> {
        if !matches!(self.state, ResponderState::AwaitingRequest) {
            return Err(HandshakeError::UnexpectedMessage {
                got: MessageKind::AuthRequest,
                state: self.state.name(),
            });
        }

        let transcript = request_transcript(agent_id, public_key, nonce);
        if !verify_hmac_sha256(&self.psk, transcript.as_bytes(), mac) {
            return Err(HandshakeError::BadMac(MessageKind::AuthRequest));
        }

        let (secret, our_public) = generate_keypair();
        let our_nonce = generate_nonce();

        let response_mac = hmac_sha256(
            &self.psk,
            response_transcript(agent_id, our_public.as_bytes(), &our_nonce, public_key, nonce)
                .as_bytes(),
        );

        let shared = secret.diffie_hellman(&PublicKey::from(*public_key));
        let session_key = derive_session_key(&self.psk, shared.as_bytes(), nonce, &our_nonce);

        self.state = ResponderState::AwaitingFinish {
            agent_id: agent_id.to_string(),
            session_key,
        };
        Ok(Message::AuthResponse {
            public_key: *our_public.as_bytes(),
            nonce: our_nonce,
            mac: response_mac,
        })
    }

    /// Handle `AuthFinish`: proves the initiator derived the same key.
    /// Returns the verified identity. The transcript binds the identity
    /// from the original request, so a swapped id fails the MAC.
    pub fn on_finish(&mut self, mac: &[u8]) -> Result<String, HandshakeError> {
        let (agent_id, session_key) =
            match std::mem::replace(&mut self.state, ResponderState::AwaitingRequest) {
                ResponderState::AwaitingFinish {
                    agent_id,
                    session_key,
                } => (agent_id, session_key),
                other => {
                    let state = other.name();
                    self.state = other;
                    return Err(HandshakeError::UnexpectedMessage {
                        got: MessageKind::AuthFinish,
                        state,
                    });
                }
            };

        let transcript = finish_transcript(&agent_id);
        if !verify_hmac_sha256(session_key.as_bytes(), transcript.as_bytes(), mac) {
            return Err(HandshakeError::BadMac(MessageKind::AuthFinish));
        }

        self.state = ResponderState::Verified {
            agent_id: agent_id.clone(),
            session_key,
        };
        Ok(agent_id)
    }

    /// Accept the verified initiator: returns the `AuthResult { Ok }` to
    /// send and the session key to install. Accepting consumes the state.
    pub fn accept(&mut self) -> Result<(Message, SessionKey), HandshakeError> {
        let (agent_id, session_key) =
            match std::mem::replace(&mut self.state, ResponderState::Done) {
                ResponderState::Verified {
                    agent_id,
                    session_key,
                } => (agent_id, session_key),
                other => {
                    let state = other.name();
                    self.state = other;
                    return Err(HandshakeError::InvalidState {
                        op: "accept",
                        state,
                    });
                }
            };

        let mac = hmac_sha256(
            session_key.as_bytes(),
            result_transcript(&agent_id, AuthOutcome::Ok).as_bytes(),
        );
        Ok((
            Message::AuthResult {
                outcome: AuthOutcome::Ok,
                mac,
            },
            session_key,
        ))
    }

    /// Refuse a taken identity: returns the `AuthResult {
    /// DuplicateAgentId }` to send and resets to await a fresh
    /// `AuthRequest` on the same connection.
    pub fn reject_duplicate(&mut self) -> Result<Message, HandshakeError> {
        let (agent_id, session_key) =
            match std::mem::replace(&mut self.state, ResponderState::AwaitingRequest) {
                ResponderState::Verified {
                    agent_id,
                    session_key,
                } => (agent_id, session_key),
                other => {
                    let state = other.name();
                    self.state = other;
                    return Err(HandshakeError::InvalidState {
                        op: "reject_duplicate",
                        state,
                    });
                }
            };

        let mac = hmac_sha256(
            session_key.as_bytes(),
            result_transcript(&agent_id, AuthOutcome::DuplicateAgentId).as_bytes(),
        );
        Ok(Message::AuthResult {
            outcome: AuthOutcome::DuplicateAgentId,
            mac,
        })
    }
}
