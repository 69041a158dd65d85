//! Cryptographic primitives for the device transport.
//!
//! This module provides the two layers every session is built on:
//!
//! - **RSA key transport**: the Initiator encrypts a fresh session key to the
//!   Responder's public key (PKCS#1 v1.5)
//! - **AES-256-CBC envelopes**: every post-handshake message is sealed under
//!   that session key with a random IV
//!
//! # Key Lifecycle
//!
//! ```text
//! Responder                                   Initiator
//!   KeyPair::generate(size)  (long-lived)
//!   public_pem() ───────────────────────────►  import_public_pem()
//!                                              SessionKey::generate()
//!   decrypt_session_key()  ◄──────────────────  encrypt_session_key()
//!
//!   envelope::open / seal  ◄═══════════════════► envelope::seal / open
//! ```
//!
//! Session keys never outlive their connection and are zeroized on drop.
//!
//! # Wire Format
//!
//! ```text
//! envelope = base64( iv:16 ‖ AES-256-CBC( plaintext ‖ pad ) )
//! pad      = n bytes of value n, 1 <= n <= 32
//! ```

mod envelope;
mod error;
mod exchange;
mod keys;

pub use envelope::{open, open_str, seal, seal_str, EnvelopeError};
pub use error::CryptoError;
pub use exchange::{
    encrypt_session_key, export_public_pem, import_public_pem, KeyExchangeError, KeyPair, KeySize,
};
pub use keys::SessionKey;

pub use rsa::RsaPublicKey;

/// Session key size (AES-256, 256 bits)
pub const SESSION_KEY_SIZE: usize = 32;

/// CBC initialization vector size (one AES block)
pub const IV_SIZE: usize = 16;

/// Padding granularity for envelope plaintexts
pub const PAD_BLOCK: usize = 32;
