//! Unified cryptographic error type.
//!
//! Aggregates the envelope and key-exchange errors so callers can propagate
//! either with `?` while keeping the original cause reachable through
//! `#[source]`.

use thiserror::Error;

use super::envelope::EnvelopeError;
use super::exchange::KeyExchangeError;

/// Unified error type for all cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Envelope sealing/opening error.
    ///
    /// Raised for anything structurally wrong with a received envelope:
    /// bad base64, truncated ciphertext, or padding that does not verify.
    #[error("Envelope: {0}")]
    Envelope(#[source] EnvelopeError),

    /// RSA key exchange error.
    #[error("Key exchange: {0}")]
    Exchange(#[source] KeyExchangeError),
}

impl From<EnvelopeError> for CryptoError {
    fn from(err: EnvelopeError) -> Self {
        CryptoError::Envelope(err)
    }
}

impl From<KeyExchangeError> for CryptoError {
    fn from(err: KeyExchangeError) -> Self {
        CryptoError::Exchange(err)
    }
}
