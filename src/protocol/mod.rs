//! Device transport protocol: framing, handshake and message bodies.
//!
//! Every connection runs a fixed exchange between a device (Initiator) and
//! the collector (Responder). A mutual RSA handshake establishes a per-session
//! AES key; everything after it travels as sealed envelopes.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator (device)                    Responder (collector)
//!    |                                     |
//!    |<------------- 199 ------------------|  AwaitRequest
//!    |-------------- 200 ----------------->|
//!    |<------------- key size -------------|  NegotiateKeySize
//!    |-------------- 200 | 400 ----------->|
//!    |<------------- PEM public key -------|  ExchangePubkey
//!    |-------------- RSA(session key) ---->|
//!    |<------------- 200 ------------------|  ConfirmKey
//!    |============== sealed PEM ==========>|  ExchangeInitiatorPubkey
//!    |<------------- 200 ------------------|  Complete
//!    |                                     |
//!    |============== device id ===========>|  (sealed from here on)
//!    |<============= 200 ==================|
//!    |============== payload ============>|
//!    |<============= 210 ==================|  only for unknown devices
//!    |============== device info ========>|
//!    |<============= 220, new id =========|
//!    |============== 200 ================>|
//!    |<============= 200 ==================|  final ack, close
//! ```
//!
//! ## Markers
//!
//! | Marker | Meaning                          |
//! |--------|----------------------------------|
//! | `199`  | Handshake request                |
//! | `200`  | Positive acknowledgement         |
//! | `400`  | Negative acknowledgement         |
//! | `210`  | Device info request              |
//! | `220`  | Identifier reassignment follows  |
//!
//! Every unit on the wire is terminated by `\r\n`; see [`FrameStream`].

mod channel;
mod frame;
mod handshake;
mod message;

use std::time::Duration;

pub use channel::SecureChannel;
pub use frame::FrameStream;
pub use handshake::{EstablishedKeys, Initiator, Responder};
pub use message::{ChannelReadings, DeviceId, DeviceInfo, Marker, TelemetryPayload};

/// Frame terminator
pub const FRAME_TERMINATOR: &[u8] = b"\r\n";

/// Deadline applied to every read (5 seconds)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest frame accepted by default (64 KiB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Handshake step, reported when the handshake fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Handshake request / acknowledgement
    AwaitRequest,
    /// RSA key size offer
    NegotiateKeySize,
    /// Responder public key out, encrypted session key back
    ExchangePubkey,
    /// Responder confirms the session key
    ConfirmKey,
    /// Initiator public key, sealed under the session key
    ExchangeInitiatorPubkey,
    /// Final acknowledgement
    Complete,
}
