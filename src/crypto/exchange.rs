//! RSA key transport for the session handshake.
//!
//! The Responder publishes a long-lived RSA public key; the Initiator
//! encrypts a fresh [`SessionKey`] to it with PKCS#1 v1.5. Public keys travel
//! as PKCS#1 PEM with LF line endings and the encrypted key travels as base64,
//! so neither can contain the frame terminator.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use rand::{CryptoRng, RngCore};
use thiserror::Error;
use zeroize::Zeroize;

use super::keys::SessionKey;

/// Errors from key exchange operations
#[derive(Debug, Error)]
pub enum KeyExchangeError {
    /// Key size outside the allow list
    #[error("Unsupported RSA key size: {0} bits")]
    UnsupportedKeySize(u32),

    /// Key generation failed
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    /// Public key could not be exported or parsed
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Encrypting the session key failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decrypting the session key failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Negotiable RSA modulus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySize(u32);

impl KeySize {
    /// Sizes both endpoints accept.
    pub const SUPPORTED: [u32; 4] = [521, 1024, 2048, 4092];

    /// Default negotiated size.
    pub const DEFAULT: KeySize = KeySize(1024);

    /// Validate a bit length against the allow list.
    pub fn new(bits: u32) -> Result<Self, KeyExchangeError> {
        if Self::SUPPORTED.contains(&bits) {
            Ok(Self(bits))
        } else {
            Err(KeyExchangeError::UnsupportedKeySize(bits))
        }
    }

    /// Modulus size in bits.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Default for KeySize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for KeySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KeySize {
    type Err = KeyExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits = s
            .trim()
            .parse::<u32>()
            .map_err(|_| KeyExchangeError::UnsupportedKeySize(0))?;
        Self::new(bits)
    }
}

impl TryFrom<u32> for KeySize {
    type Error = KeyExchangeError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        Self::new(bits)
    }
}

impl From<KeySize> for u32 {
    fn from(size: KeySize) -> Self {
        size.0
    }
}

/// RSA key pair (private + public)
pub struct KeyPair {
    secret: RsaPrivateKey,
    public: RsaPublicKey,
    size: KeySize,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate(size: KeySize) -> Result<Self, KeyExchangeError> {
        Self::generate_with(&mut rand::thread_rng(), size)
    }

    /// Generate from a caller-supplied RNG (deterministic in tests).
    pub fn generate_with<R: CryptoRng + RngCore>(
        rng: &mut R,
        size: KeySize,
    ) -> Result<Self, KeyExchangeError> {
        let secret = RsaPrivateKey::new(rng, size.bits() as usize)
            .map_err(|e| KeyExchangeError::GenerationFailed(e.to_string()))?;
        let public = RsaPublicKey::from(&secret);

        Ok(Self {
            secret,
            public,
            size,
        })
    }

    /// Public half.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Negotiated modulus size this pair was generated for.
    pub fn size(&self) -> KeySize {
        self.size
    }

    /// PKCS#1 PEM of the public key.
    pub fn public_pem(&self) -> Result<String, KeyExchangeError> {
        export_public_pem(&self.public)
    }

    /// Recover a session key sent by [`encrypt_session_key`].
    pub fn decrypt_session_key(&self, wire: &[u8]) -> Result<SessionKey, KeyExchangeError> {
        let ciphertext = STANDARD
            .decode(wire)
            .map_err(|e| KeyExchangeError::DecryptionFailed(e.to_string()))?;

        let mut plaintext = self
            .secret
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(|e| KeyExchangeError::DecryptionFailed(e.to_string()))?;

        let key = SessionKey::from_slice(&plaintext);
        plaintext.zeroize();

        key.ok_or_else(|| {
            KeyExchangeError::DecryptionFailed("session key has wrong length".to_string())
        })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("size", &self.size)
            .field("modulus_bits", &self.public.n().bits())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Export a public key as PKCS#1 PEM with LF line endings.
pub fn export_public_pem(key: &RsaPublicKey) -> Result<String, KeyExchangeError> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| KeyExchangeError::InvalidPublicKey(e.to_string()))
}

/// Import a public key from PKCS#1 PEM.
pub fn import_public_pem(pem: &str) -> Result<RsaPublicKey, KeyExchangeError> {
    RsaPublicKey::from_pkcs1_pem(pem.trim())
        .map_err(|e| KeyExchangeError::InvalidPublicKey(e.to_string()))
}

/// Encrypt a session key to `peer` and base64 it for the wire.
pub fn encrypt_session_key(
    peer: &RsaPublicKey,
    key: &SessionKey,
) -> Result<Vec<u8>, KeyExchangeError> {
    let ciphertext = peer
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, key.as_bytes())
        .map_err(|e| KeyExchangeError::EncryptionFailed(e.to_string()))?;

    Ok(STANDARD.encode(ciphertext).into_bytes())
}
