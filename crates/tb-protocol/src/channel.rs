//! Message transport over a framed byte stream
//!
//! A `MessageChannel` wraps any `AsyncRead + AsyncWrite` stream with the
//! frame codec and bincode serialization. It starts in plaintext for the
//! handshake; `install_cipher` switches every later message through the
//! AEAD layer. Any error is fatal: callers drop the channel rather than
//! resynchronize.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::crypto::SessionCipher;
use crate::error::ProtocolError;
use crate::message::Message;

/// Bidirectional message channel over a byte stream
pub struct MessageChannel<S> {
    framed: Framed<S, FrameCodec>,
    cipher: Option<SessionCipher>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageChannel<S> {
    /// Wrap a stream; the channel starts unsealed
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            cipher: None,
        }
    }

    /// Install the session cipher. Every message after this call is
    /// sealed/opened; only call once both sides reached the
    /// authenticated state.
    pub fn install_cipher(&mut self, cipher: SessionCipher) {
        self.cipher = Some(cipher);
    }

    /// Whether the AEAD layer is active
    pub fn is_sealed(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serialize (and seal, once authenticated) a message and send it
    pub async fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let mut payload = message.encode()?;
        if let Some(cipher) = &self.cipher {
            payload = cipher.seal(&payload)?;
        }
        self.framed.send(Bytes::from(payload)).await
    }

    /// Receive the next message; `None` means the peer closed the stream
    pub async fn recv(&mut self) -> Option<Result<Message, ProtocolError>> {
        let frame = match self.framed.next().await? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e)),
        };

        let result = match &self.cipher {
            Some(cipher) => cipher
                .open(&frame)
                .map_err(ProtocolError::from)
                .and_then(|plain| Message::decode(&plain)),
            None => Message::decode(&frame),
        };
        Some(result)
    }

    /// Consume the channel and return the underlying stream
    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}
