//! Session key material.
//!
//! A [`SessionKey`] lives for exactly one connection. It is generated by the
//! Initiator, transported to the Responder under RSA, and zeroized when the
//! owning session drops it, on success or failure.

use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::SESSION_KEY_SIZE;

/// Bits of fresh entropy hashed into each session key.
const KEY_SEED_BITS: usize = 128;

/// Symmetric session key (AES-256).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Generate a fresh key: SHA-256 over 128 random bits.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Generate a key from a caller-supplied RNG.
    pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut seed = [0u8; KEY_SEED_BITS / 8];
        rng.fill_bytes(&mut seed);

        let digest = Sha256::digest(seed);
        seed.zeroize();

        let mut bytes = [0u8; SESSION_KEY_SIZE];
        bytes.copy_from_slice(&digest);
        Self { bytes }
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Wrap a slice, returning `None` unless it is exactly one key long.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; SESSION_KEY_SIZE] = slice.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_generated_keys_differ() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_seeded_generation_is_deterministic() {
        let a = SessionKey::generate_with(&mut ChaCha8Rng::seed_from_u64(7));
        let b = SessionKey::generate_with(&mut ChaCha8Rng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_slice_length() {
        assert!(SessionKey::from_slice(&[1u8; SESSION_KEY_SIZE]).is_some());
        assert!(SessionKey::from_slice(&[1u8; 16]).is_none());
        assert!(SessionKey::from_slice(&[]).is_none());
    }

    #[test]
    fn test_debug_redacts() {
        let key = SessionKey::from_bytes([0x42; SESSION_KEY_SIZE]);
        let shown = format!("{:?}", key);
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains("66"));
    }
}
