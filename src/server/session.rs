//! Per-connection device session (collector side).
//!
//! ```text
//! handshake ─► device id ─► 200 ─► payload ─┬─────────────────────────────► persist ─► 200
//!                                           └─ unknown: 210 ─► info ─► 220 ─► id ─► 200 ┘
//! ```
//!
//! Protocol failures are answered with `400`; identity failures with `200`
//! so the device simply retries on its next cycle. Either way the connection
//! is closed at the end.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::identity::{resolve_location, LocationLocks};
use super::writes::WriteTracker;
use crate::error::Result;
use crate::protocol::{
    DeviceId, DeviceInfo, FrameStream, Marker, Responder, SecureChannel, TelemetryPayload,
};
use crate::storage::Storage;

/// Shared state every session needs.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Handshake responder holding the collector key pair
    pub responder: Responder,
    /// Telemetry database
    pub storage: Storage,
    /// Provisioning locks
    pub locks: LocationLocks,
    /// Background writes
    pub writes: WriteTracker,
    /// Per-read deadline
    pub read_timeout: Duration,
    /// Largest accepted frame
    pub max_frame_bytes: usize,
}

/// How a session ended, when it ended without a protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Payload accepted for persistence under `device`.
    Stored {
        /// Resolved identifier
        device: DeviceId,
        /// Samples in the payload
        samples: usize,
        /// Whether the device was (re)assigned an identifier
        reassigned: bool,
    },
    /// The device could not be identified; nothing was persisted.
    IdentityUnresolved,
}

enum Resolution {
    Known(DeviceId),
    Reassigned(DeviceId),
    Unresolved,
}

/// One device connection.
#[derive(Debug)]
pub struct DeviceSession {
    ctx: Arc<SessionContext>,
}

impl DeviceSession {
    /// Bind a session to the collector state.
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    /// Run the full exchange over `stream` and close it.
    pub async fn run<S>(&self, stream: S) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frames = FrameStream::new(stream)
            .with_read_timeout(self.ctx.read_timeout)
            .with_max_frame_bytes(self.ctx.max_frame_bytes);

        let keys = match self.ctx.responder.run(&mut frames).await {
            Ok(keys) => keys,
            Err(e) => {
                frames.close().await;
                return Err(e);
            },
        };

        let mut channel = SecureChannel::new(frames, keys);
        let result = self.exchange(&mut channel).await;
        if let Err(e) = &result {
            if e.wants_nack() {
                channel.send_nack_best_effort().await;
            }
        }
        channel.close().await;
        result
    }

    async fn exchange<S>(&self, channel: &mut SecureChannel<S>) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let claimed: DeviceId = channel.recv_str("device id").await?.parse()?;
        debug!(device = %claimed, "device id received");
        channel.send_marker(Marker::Ack).await?;

        let body = channel.recv("telemetry payload").await?;
        let payload = TelemetryPayload::from_json(&body)?;
        debug!(samples = payload.len(), "payload decoded");

        let (device, reassigned) = match self.resolve(channel, claimed).await? {
            Resolution::Known(id) => (id, false),
            Resolution::Reassigned(id) => (id, true),
            Resolution::Unresolved => {
                channel.send_marker(Marker::Ack).await?;
                return Ok(SessionOutcome::IdentityUnresolved);
            },
        };

        let samples = payload.len();
        if samples > 0 {
            self.ctx.writes.spawn_write(
                self.ctx.storage.clone(),
                device,
                payload.to_recordings(device),
            );
        }
        channel.send_marker(Marker::Ack).await?;

        Ok(SessionOutcome::Stored {
            device,
            samples,
            reassigned,
        })
    }

    async fn resolve<S>(
        &self,
        channel: &mut SecureChannel<S>,
        claimed: DeviceId,
    ) -> Result<Resolution>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !claimed.is_sentinel() {
            match self.ctx.storage.device_exists(claimed).await {
                Ok(true) => return Ok(Resolution::Known(claimed)),
                Ok(false) => debug!(device = %claimed, "unknown device"),
                Err(e) => {
                    warn!(device = %claimed, "device lookup failed: {}", e);
                    return Ok(Resolution::Unresolved);
                },
            }
        }

        channel.send_marker(Marker::DeviceInfoRequest).await?;
        let info = DeviceInfo::from_json(&channel.recv("device info").await?)?;

        let id = match resolve_location(&self.ctx.storage, &self.ctx.locks, &info).await {
            Ok(id) => id,
            Err(e) => {
                warn!("{}", e);
                return Ok(Resolution::Unresolved);
            },
        };

        channel.send_marker(Marker::Reassign).await?;
        channel.send(id.to_string().as_bytes()).await?;
        channel
            .expect_marker(Marker::Ack, "reassignment acknowledgement")
            .await?;
        Ok(Resolution::Reassigned(id))
    }
}
