//! Session encryption and keyed hashing
//!
//! AES-256-GCM with a fresh random 12-byte nonce per message; the sealed
//! wire form is `nonce || ciphertext || tag`. Session keys come from an
//! X25519 exchange mixed with the pre-shared key (see `handshake`). All
//! key material is zeroed on drop and redacted from `Debug` output.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// GCM nonce length in bytes
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag length in bytes
pub const TAG_SIZE: usize = 16;

/// Session key length in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Length of handshake nonces in bytes
pub const HANDSHAKE_NONCE_SIZE: usize = 32;

/// Errors from sealing or opening payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Sealing failed
    #[error("Encryption failed")]
    EncryptFailed,

    /// Opening failed: tampered data, corruption or a key mismatch.
    /// Callers must treat this as fatal for the connection.
    #[error("Decryption failed")]
    DecryptFailed,
}

/// A derived 256-bit session key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes, used as the MAC key for handshake result transcripts
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Build the per-connection cipher from this key
    pub fn cipher(&self) -> SessionCipher {
        SessionCipher::from_key(self.0)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"[REDACTED]").finish()
    }
}

/// Per-connection cipher installed once the handshake completes
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    key: [u8; KEY_SIZE],
}

impl SessionCipher {
    /// Create a cipher from a raw 256-bit key
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Seal plaintext with a fresh random nonce.
    ///
    /// Each call generates a unique nonce, so sealing the same plaintext
    /// twice produces different output.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::EncryptFailed)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed payload (`nonce || ciphertext || tag`)
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptFailed);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::DecryptFailed)?;
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh X25519 keypair for one handshake attempt.
///
/// Returns `(secret, public)`. The secret never leaves the process; the
/// public key goes out in the handshake message.
pub fn generate_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(rand::thread_rng());
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Generate a fresh 32-byte handshake nonce
pub fn generate_nonce() -> [u8; HANDSHAKE_NONCE_SIZE] {
    let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// HMAC-SHA256 of `data` under `key`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time verification of an HMAC-SHA256 tag
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Derive the session key from the ECDH shared secret and both handshake
/// nonces: `HMAC-SHA256(psk, shared_secret || initiator_nonce ||
/// responder_nonce)`. Both sides compute the same value.
pub fn derive_session_key(
    psk: &[u8],
    shared_secret: &[u8],
    initiator_nonce: &[u8; HANDSHAKE_NONCE_SIZE],
    responder_nonce: &[u8; HANDSHAKE_NONCE_SIZE],
) -> SessionKey {
    let mut input = Vec::with_capacity(shared_secret.len() + 2 * HANDSHAKE_NONCE_SIZE);
    input.extend_from_slice(shared_secret);
    input.extend_from_slice(initiator_nonce);
    input.extend_from_slice(responder_nonce);

    let digest = hmac_sha256(psk, &input);
    input.zeroize();

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest);
    SessionKey::from_bytes(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = SessionCipher::from_key([42u8; KEY_SIZE]);

        let plaintext = b"Hello, termbridge!";
        let sealed = cipher.seal(plaintext).unwrap();

        assert!(sealed.len() >= plaintext.len() + NONCE_SIZE + TAG_SIZE);
        assert_ne!(&sealed[NONCE_SIZE..], plaintext.as_slice());

        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(&opened, plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let cipher = SessionCipher::from_key([42u8; KEY_SIZE]);
        let plaintext = b"same message";

        let sealed1 = cipher.seal(plaintext).unwrap();
        let sealed2 = cipher.seal(plaintext).unwrap();

        // Same plaintext, different nonce, different ciphertext
        assert_ne!(sealed1[..NONCE_SIZE], sealed2[..NONCE_SIZE]);
        assert_ne!(sealed1[NONCE_SIZE..], sealed2[NONCE_SIZE..]);

        assert_eq!(cipher.open(&sealed1).unwrap(), plaintext);
        assert_eq!(cipher.open(&sealed2).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 = SessionCipher::from_key([1u8; KEY_SIZE]);
        let cipher2 = SessionCipher::from_key([2u8; KEY_SIZE]);

        let sealed = cipher1.seal(b"secret").unwrap();
        assert_eq!(cipher2.open(&sealed), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let cipher = SessionCipher::from_key([42u8; KEY_SIZE]);
        let mut sealed = cipher.seal(b"original").unwrap();

        let mid = sealed.len() / 2;
        sealed[mid] ^= 0xFF;

        assert_eq!(cipher.open(&sealed), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let cipher = SessionCipher::from_key([42u8; KEY_SIZE]);
        let mut sealed = cipher.seal(b"original").unwrap();
        sealed[0] ^= 0xFF;

        assert_eq!(cipher.open(&sealed), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn test_truncated_payload_fails() {
        let cipher = SessionCipher::from_key([42u8; KEY_SIZE]);
        assert_eq!(cipher.open(&[0u8; 5]), Err(CryptoError::DecryptFailed));
        assert_eq!(
            cipher.open(&[0u8; NONCE_SIZE + TAG_SIZE - 1]),
            Err(CryptoError::DecryptFailed)
        );
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = SessionCipher::from_key([7u8; KEY_SIZE]);
        let sealed = cipher.seal(b"").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_key_exchange_agreement() {
        let (agent_secret, agent_public) = generate_keypair();
        let (relay_secret, relay_public) = generate_keypair();

        let agent_shared = agent_secret.diffie_hellman(&relay_public);
        let relay_shared = relay_secret.diffie_hellman(&agent_public);
        assert_eq!(agent_shared.as_bytes(), relay_shared.as_bytes());

        let initiator_nonce = generate_nonce();
        let responder_nonce = generate_nonce();
        let psk = b"shared-token";

        let agent_key =
            derive_session_key(psk, agent_shared.as_bytes(), &initiator_nonce, &responder_nonce);
        let relay_key =
            derive_session_key(psk, relay_shared.as_bytes(), &initiator_nonce, &responder_nonce);
        assert_eq!(agent_key.as_bytes(), relay_key.as_bytes());

        // Both directions work with the derived ciphers
        let sealed = agent_key.cipher().seal(b"from agent").unwrap();
        assert_eq!(relay_key.cipher().open(&sealed).unwrap(), b"from agent");
    }

    #[test]
    fn test_session_key_depends_on_psk() {
        let shared = [3u8; 32];
        let nonce_a = [1u8; HANDSHAKE_NONCE_SIZE];
        let nonce_b = [2u8; HANDSHAKE_NONCE_SIZE];

        let key1 = derive_session_key(b"token-one", &shared, &nonce_a, &nonce_b);
        let key2 = derive_session_key(b"token-two", &shared, &nonce_a, &nonce_b);
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_session_key_depends_on_nonces() {
        let shared = [3u8; 32];
        let key1 = derive_session_key(b"t", &shared, &[1u8; 32], &[2u8; 32]);
        let key2 = derive_session_key(b"t", &shared, &[2u8; 32], &[1u8; 32]);
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"key", b"data");
        assert_eq!(tag.len(), 32);
        assert!(verify_hmac_sha256(b"key", b"data", &tag));
        assert!(!verify_hmac_sha256(b"key", b"other data", &tag));
        assert!(!verify_hmac_sha256(b"other key", b"data", &tag));
        assert!(!verify_hmac_sha256(b"key", b"data", &tag[..31]));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let cipher = SessionCipher::from_key([42u8; KEY_SIZE]);
        let debug = format!("{:?}", cipher);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));

        let key = SessionKey::from_bytes([42u8; KEY_SIZE]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }
}
