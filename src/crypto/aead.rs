//! AEAD record protection
//!
//! Supports:
//! - ChaCha20-Poly1305
//! - AES-256-GCM

use aes_gcm::{
    aead::{Aead as _, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;

use super::{NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Cipher types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    ChaCha20Poly1305,
    Aes256Gcm,
}

impl CipherKind {
    /// Get the key size for this cipher
    pub fn key_size(&self) -> usize {
        32
    }

    /// Identifier carried in the handshake
    pub fn id(&self) -> u8 {
        match self {
            CipherKind::ChaCha20Poly1305 => 1,
            CipherKind::Aes256Gcm => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(CipherKind::ChaCha20Poly1305),
            2 => Some(CipherKind::Aes256Gcm),
            _ => None,
        }
    }
}

/// AEAD cipher implementation
pub struct AeadCipher {
    kind: CipherKind,
    inner: CipherInner,
}

enum CipherInner {
    ChaCha20Poly1305(ChaCha20Poly1305),
    Aes256Gcm(Aes256Gcm),
}

impl AeadCipher {
    /// Create a new AEAD cipher with the given key
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        if key.len() != kind.key_size() {
            return Err(Error::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                kind.key_size(),
                key.len()
            )));
        }

        let inner = match kind {
            CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(CipherInner::ChaCha20Poly1305)
                .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?,
            CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(CipherInner::Aes256Gcm)
                .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?,
        };

        Ok(Self { kind, inner })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Encrypt plaintext with associated data
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, payload),
            CipherInner::Aes256Gcm(cipher) => cipher.encrypt(nonce, payload),
        };
        result.map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt ciphertext with associated data
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Crypto("Ciphertext too short".to_string()));
        }
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, payload),
            CipherInner::Aes256Gcm(cipher) => cipher.decrypt(nonce, payload),
        };
        result.map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
    }
}
