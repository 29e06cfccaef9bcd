//! Encrypted field values.
//!
//! Sensitive payment fields are stored as [`Sealed`] text: base64 of
//! `nonce (12 bytes) || AES-256-GCM ciphertext`. Sealing and opening happen
//! explicitly at the API boundary through a [`FieldCipher`]; nothing inside
//! the engine ever sees the plaintext.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("field key must be 32 bytes of hex")]
    InvalidKey,
    #[error("encryption failed")]
    Encrypt,
    #[error("sealed value is malformed")]
    Malformed,
    #[error("decryption failed")]
    Decrypt,
}

/// Ciphertext of a sensitive field. `Debug` never prints the contents.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed(String);

impl Sealed {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sealed(..)")
    }
}

pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    /// Build from a 64-character hex key.
    pub fn from_hex_key(key: &str) -> Result<Self, SealError> {
        let bytes = hex::decode(key.trim()).map_err(|_| SealError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&bytes).map_err(|_| SealError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Random key; values sealed with it do not survive a restart.
    pub fn ephemeral() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<Sealed, SealError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SealError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(Sealed(STANDARD.encode(out)))
    }

    pub fn open(&self, sealed: &Sealed) -> Result<String, SealError> {
        let raw = STANDARD.decode(&sealed.0).map_err(|_| SealError::Malformed)?;
        if raw.len() <= NONCE_LEN {
            return Err(SealError::Malformed);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| SealError::Malformed)
    }
}
