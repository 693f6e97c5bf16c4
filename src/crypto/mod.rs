//! Sealing for persisted browser state
//!
//! Cookies and web storage are encrypted with AES-256-GCM before they reach
//! a [`SessionStore`](crate::browser::persistence::SessionStore). Sealed
//! values are `base64(nonce || ciphertext)` so they fit a text column.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256-GCM encryption key size
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM
pub const NONCE_SIZE: usize = 12;

const KDF_SALT: &[u8] = b"taskpilot.session-store.v1";
const KDF_INFO: &[u8] = b"browser-session-state";

/// Symmetric cipher for session columns. Key material is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    key: [u8; KEY_SIZE],
}

impl SessionCipher {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Random key; sealed data does not survive a restart
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Derive a key from an operator-supplied secret with HKDF-SHA256
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Crypto("Session secret must not be empty".to_string()));
        }
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), secret.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hk.expand(KDF_INFO, &mut key)
            .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        Ok(Self { key })
    }

    /// Encrypt and base64-encode
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    /// Decode and decrypt a value produced by [`seal`](Self::seal)
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| Error::Crypto(format!("Invalid sealed value: {}", e)))?;
        if bytes.len() < NONCE_SIZE {
            return Err(Error::Crypto("Ciphertext too short".to_string()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;

        let (nonce, encrypted) = bytes.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), encrypted)
            .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
    }

    /// Serialize to JSON and seal
    pub fn seal_json<T: serde::Serialize>(&self, value: &T) -> Result<String> {
        let json = serde_json::to_vec(value)?;
        self.seal(&json)
    }

    /// Open and deserialize from JSON
    pub fn open_json<T: serde::de::DeserializeOwned>(&self, sealed: &str) -> Result<T> {
        let json = self.open(sealed)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher([redacted])")
    }
}
