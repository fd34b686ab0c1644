//! Credential encryption for storage in the bookkeeping database.
//!
//! Uses AES-256-GCM with a random nonce per token.
//!
//! # Token layout
//!
//! ```text
//! base64url( version(1) || nonce(12) || ciphertext || tag(16) )
//! ```
//!
//! Tokens are plain ASCII so they fit the existing text columns. The key is
//! 32 random bytes, base64url encoded (44 characters with padding).

use aes_gcm::{
    Aes256Gcm, Key, KeyInit, Nonce,
    aead::{Aead, AeadCore, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use thiserror::Error;

/// Size of the AES-256 key in bytes.
const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag.
const TAG_SIZE: usize = 16;

const TOKEN_VERSION: u8 = 0x01;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption key is not configured")]
    MissingKey,

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}

/// Symmetric authenticated cipher holding the process-wide key.
pub struct SecretCipher {
    key: SecretBox<[u8; KEY_SIZE]>,
}

impl SecretCipher {
    /// Build a cipher from the encoded key. Intended to be called once at
    /// startup; an error here is a configuration error.
    pub fn from_encoded_key(encoded: &SecretString) -> Result<Self, CipherError> {
        let raw = URL_SAFE
            .decode(encoded.expose_secret().trim())
            .map_err(|e| CipherError::InvalidKey(format!("not url-safe base64: {e}")))?;
        let key: [u8; KEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
            CipherError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes after decoding, got {}",
                raw.len()
            ))
        })?;
        Ok(Self {
            key: SecretBox::new(Box::new(key)),
        })
    }

    /// Like [`from_encoded_key`](Self::from_encoded_key) but for an optional
    /// config value.
    pub fn from_config(encoded: Option<&str>) -> Result<Self, CipherError> {
        let encoded = encoded.ok_or(CipherError::MissingKey)?;
        Self::from_encoded_key(&SecretString::from(encoded.to_string()))
    }

    /// Generate a fresh encoded key.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        URL_SAFE.encode(key.as_slice())
    }

    /// Encrypt a credential into an ASCII token.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let cipher = self.cipher();
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CipherError::EncryptionFailed(e.to_string()))?;

        let mut token = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);

        Ok(URL_SAFE.encode(token))
    }

    /// Decrypt a token produced by [`encrypt`](Self::encrypt) under the same key.
    pub fn decrypt(&self, token: &str) -> Result<String, CipherError> {
        let raw = URL_SAFE
            .decode(token.trim())
            .map_err(|_| CipherError::InvalidToken)?;

        if raw.len() < 1 + NONCE_SIZE + TAG_SIZE || raw[0] != TOKEN_VERSION {
            return Err(CipherError::InvalidToken);
        }

        let (nonce_bytes, ciphertext) = raw[1..].split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::InvalidToken)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::InvalidToken)
    }

    fn cipher(&self) -> Aes256Gcm {
        let key = Key::<Aes256Gcm>::from_slice(self.key.expose_secret());
        Aes256Gcm::new(key)
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
