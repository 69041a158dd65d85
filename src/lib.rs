//! # Field Telemetry - Encrypted Device Ingestion and Retention
//!
//! Collector and device library for periodic environmental telemetry sent by
//! remote field devices over an untrusted network.
//!
//! ## Features
//!
//! - **Per-connection key establishment**: mutual RSA handshake yielding an
//!   AES-256-CBC session key
//! - **Framed envelopes**: `\r\n`-terminated, base64 sealed messages with read
//!   deadlines and a frame size limit
//! - **Auto-provisioning**: unknown devices report their location and receive
//!   a fresh 10-digit identifier
//! - **Concurrent sessions**: one task per connection, isolated failures,
//!   background writes with one reopen-and-retry
//! - **Retention**: day/month/year tiers averaging old readings into time
//!   buckets, one transaction per device
//!
//! ### Architecture
//!
//! ```text
//! Device (Initiator)              Collector (Responder)
//!    |                               |
//!    |====== handshake (RSA) =======>|  Dispatcher ─► DeviceSession
//!    |====== id, payload (AES) =====>|                    │
//!    |<===== 210 / 220 / 200 ========|                    ▼
//!    |                               |            Storage (SQLite)
//!    |                               |                    ▲
//!    |                               |  RetentionEngine ──┘ (every 24 h)
//! ```
//!
//! ## Quick Start
//!
//! ### Collector
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use telemetry::{Config, Dispatcher};
//!
//! let config = Arc::new(Config::load(None)?);
//! Dispatcher::new(config).run().await?;
//! ```
//!
//! ### Device
//!
//! ```rust,ignore
//! use telemetry::{DeviceClient, TelemetryPayload};
//!
//! let mut client = DeviceClient::new(config.device.clone());
//! let report = client.upload(&payload).await?;
//! println!("device id: {}", report.device_id);
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Envelope codec, RSA key transport, session keys
//! - [`protocol`]: Framing, markers, message bodies, handshake
//! - [`server`]: Connection dispatcher and device sessions
//! - [`client`]: Device-side upload cycle
//! - [`sensor`]: Acquisition-to-upload channel
//! - [`storage`]: SQLite persistence
//! - [`retention`]: Downsampling engine
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod retention;
pub mod sensor;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use client::{DeviceClient, UploadReport};
pub use config::{Config, DeviceConfig};
pub use error::{Result, TelemetryError};
pub use protocol::{ChannelReadings, DeviceId, DeviceInfo, TelemetryPayload};
pub use retention::{RetentionEngine, RetentionReport, Tier};
pub use sensor::{ReadingChannel, ReadingSender, SampleBatch};
pub use server::{Dispatcher, ShutdownHandle};
pub use storage::Storage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
