//! Cryptographic primitives for the pre-shared-key session
//!
//! - ChaCha20-Poly1305 and AES-256-GCM record protection
//! - X25519 ephemeral key exchange
//! - HKDF-SHA256 key schedule and HMAC-SHA256 finish MACs

mod aead;
mod key_exchange;

pub use aead::{AeadCipher, CipherKind};
pub use key_exchange::EphemeralX25519;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Nonce size for AEAD ciphers (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Tag size for AEAD ciphers (16 bytes)
pub const TAG_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// 32 random bytes, the size of a handshake random
pub fn random_32() -> [u8; 32] {
    use rand::RngCore;
    let mut out = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Derive a key using HKDF-SHA256
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8], key_len: usize) -> Result<Vec<u8>> {
    use hkdf::Hkdf;

    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = vec![0u8; key_len];
    hk.expand(info, &mut okm)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute HMAC-SHA256
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("HMAC key rejected: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time check of an HMAC-SHA256 tag
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("HMAC key rejected: {}", e)))?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_32() {
        assert_ne!(random_32(), random_32());
    }

    #[test]
    fn test_derive_key() {
        let a = derive_key(b"secret", b"salt", b"client key", 32).unwrap();
        let b = derive_key(b"secret", b"salt", b"server key", 32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hmac_rfc4231_case2() {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            tag[..8],
            [0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e]
        );
        assert!(verify_hmac_sha256(b"Jefe", b"what do ya want for nothing?", &tag).unwrap());
        assert!(!verify_hmac_sha256(b"Jeff", b"what do ya want for nothing?", &tag).unwrap());
    }

    #[test]
    fn test_sha256() {
        let hash = sha256(b"abc");
        assert_eq!(hash[..4], [0xba, 0x78, 0x16, 0xbf]);
    }
}
