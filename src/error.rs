//! Telemetry collector error types.
//!
//! # Error Classification
//!
//! Errors follow the failure taxonomy of the collector:
//!
//! - **Transport**: socket I/O failure or a read that exceeded its deadline.
//!   The session is aborted and the socket closed; nothing is retried.
//! - **Protocol**: unexpected marker, malformed envelope, oversized frame or
//!   unsupported key size. The session is aborted after a negative ack.
//! - **Identity**: the device could not be provisioned. The session ends after
//!   a positive ack so the device retries on its next cycle.
//! - **Storage**: persistence failure, surfaced from [`StorageError`].
//!
//! The `Crypto` and `Storage` variants preserve the full error chain via
//! `#[source]`, enabling debugging tools to display complete error context.

use thiserror::Error;

use crate::crypto::{CryptoError, EnvelopeError, KeyExchangeError};
use crate::protocol::HandshakeStep;
use crate::storage::StorageError;

/// Telemetry collector errors.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// A read did not complete before its deadline.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Peer closed the connection mid-frame or before replying.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Protocol-level error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer answered with something other than the expected marker.
    #[error("Unexpected reply: expected {expected}, got {got:?}")]
    UnexpectedMarker {
        /// Marker the protocol required at this point.
        expected: &'static str,
        /// What actually arrived (lossy UTF-8, truncated).
        got: String,
    },

    /// Handshake aborted at the given step.
    #[error("Handshake failed at {step:?}: {reason}")]
    Handshake {
        /// Step that failed.
        step: HandshakeStep,
        /// Human readable cause.
        reason: String,
    },

    /// Frame exceeded the configured maximum size.
    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge {
        /// Configured limit.
        limit: usize,
    },

    /// Invalid device identifier.
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    /// Device provisioning failed.
    #[error("Identity resolution failed: {0}")]
    Identity(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Server startup or runtime error.
    #[error("Server error: {0}")]
    Server(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelemetryError {
    /// Whether a negative acknowledgement should be attempted before closing.
    ///
    /// Transport failures leave the channel in an unknown state, so only
    /// protocol-class failures are answered.
    pub fn wants_nack(&self) -> bool {
        matches!(
            self,
            TelemetryError::Protocol(_)
                | TelemetryError::UnexpectedMarker { .. }
                | TelemetryError::Handshake { .. }
                | TelemetryError::FrameTooLarge { .. }
                | TelemetryError::InvalidDeviceId(_)
                | TelemetryError::Crypto(_)
                | TelemetryError::Json(_)
        )
    }
}

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

impl From<CryptoError> for TelemetryError {
    fn from(err: CryptoError) -> Self {
        TelemetryError::Crypto(err)
    }
}

impl From<EnvelopeError> for TelemetryError {
    fn from(err: EnvelopeError) -> Self {
        TelemetryError::Crypto(CryptoError::from(err))
    }
}

impl From<KeyExchangeError> for TelemetryError {
    fn from(err: KeyExchangeError) -> Self {
        TelemetryError::Crypto(CryptoError::from(err))
    }
}

impl From<StorageError> for TelemetryError {
    fn from(err: StorageError) -> Self {
        TelemetryError::Storage(err)
    }
}

impl From<toml::de::Error> for TelemetryError {
    fn from(err: toml::de::Error) -> Self {
        TelemetryError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_source_chain() {
        use std::error::Error;

        let err: TelemetryError = CryptoError::from(EnvelopeError::BadPadding).into();
        assert!(err.to_string().contains("Crypto"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_nack_classification() {
        assert!(TelemetryError::Protocol("x".to_string()).wants_nack());
        assert!(!TelemetryError::Timeout("device id").wants_nack());
        assert!(!TelemetryError::ConnectionClosed.wants_nack());
    }
}
