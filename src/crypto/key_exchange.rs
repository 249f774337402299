//! Key exchange using X25519

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Error, Result};

/// Ephemeral X25519 key pair (for one-time use)
pub struct EphemeralX25519 {
    public: PublicKey,
    secret: EphemeralSecret,
}

impl EphemeralX25519 {
    /// Generate a new ephemeral key pair
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform key exchange (consumes the secret). Low-order peer keys,
    /// which force an all-zero secret, are refused.
    pub fn exchange(self, peer_public: &[u8; 32]) -> Result<[u8; 32]> {
        let peer_public = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(Error::Crypto("non-contributory key share".into()));
        }
        Ok(*shared.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_key_exchange() {
        let alice = EphemeralX25519::generate();
        let bob = EphemeralX25519::generate();
        let alice_public = alice.public_key_bytes();
        let bob_public = bob.public_key_bytes();

        let shared1 = alice.exchange(&bob_public).unwrap();
        let shared2 = bob.exchange(&alice_public).unwrap();
        assert_eq!(shared1, shared2);
    }

    #[test]
    fn test_zero_share_rejected() {
        let alice = EphemeralX25519::generate();
        assert!(alice.exchange(&[0u8; 32]).is_err());
    }
}
