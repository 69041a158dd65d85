//! Device-side session (Initiator).
//!
//! One upload cycle connects to the collector, runs the handshake, submits
//! the device identifier and the accumulated payload, and answers the
//! collector's device-info and identifier-reassignment requests. A
//! reassigned identifier replaces the client's config snapshot.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::error::{Result, TelemetryError};
use crate::protocol::{
    DeviceId, FrameStream, Initiator, Marker, SecureChannel, TelemetryPayload,
};
use crate::sensor::ReadingChannel;

/// Collector replies handled after the payload, at most one of each kind
/// plus the final ack.
const MAX_REPLIES: usize = 3;

/// Result of one successful upload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    /// Identifier in effect after the cycle
    pub device_id: DeviceId,
    /// Whether the collector assigned a new identifier
    pub reassigned: bool,
    /// Device info was requested but no identifier followed; the payload
    /// was not stored and the device stays unconfigured
    pub provisioning_pending: bool,
}

/// Uploads telemetry to the collector.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    config: DeviceConfig,
    initiator: Initiator,
}

impl DeviceClient {
    /// Client for the configured collector.
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            initiator: Initiator::new(),
        }
    }

    /// Replace the handshake settings.
    pub fn with_initiator(mut self, initiator: Initiator) -> Self {
        self.initiator = initiator;
        self
    }

    /// Current config snapshot.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Connect and run one upload cycle.
    pub async fn upload(&mut self, payload: &TelemetryPayload) -> Result<UploadReport> {
        let addr = self.config.server_addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TelemetryError::Server(format!("Failed to connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        self.upload_over(stream, payload).await
    }

    /// Run one upload cycle over an established stream.
    pub async fn upload_over<S>(
        &mut self,
        stream: S,
        payload: &TelemetryPayload,
    ) -> Result<UploadReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frames = FrameStream::new(stream).with_read_timeout(self.config.read_timeout());
        let keys = match self.initiator.run(&mut frames).await {
            Ok(keys) => keys,
            Err(e) => {
                frames.close().await;
                return Err(e);
            },
        };

        let mut channel = SecureChannel::new(frames, keys);
        let result = self.exchange(&mut channel, payload).await;
        if let Err(e) = &result {
            if e.wants_nack() {
                channel.send_nack_best_effort().await;
            }
        }
        channel.close().await;
        result
    }

    async fn exchange<S>(
        &mut self,
        channel: &mut SecureChannel<S>,
        payload: &TelemetryPayload,
    ) -> Result<UploadReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        channel
            .send(self.config.device_id.to_string().as_bytes())
            .await?;
        channel
            .expect_marker(Marker::Ack, "device id acknowledgement")
            .await?;
        channel.send(&payload.to_json()?).await?;

        let mut info_requested = false;
        let mut reassigned = false;

        for _ in 0..MAX_REPLIES {
            let reply = channel.recv("collector reply").await?;
            match Marker::parse(&reply) {
                Some(Marker::Ack) => {
                    return Ok(UploadReport {
                        device_id: self.config.device_id,
                        reassigned,
                        provisioning_pending: info_requested && !reassigned,
                    });
                },
                Some(Marker::DeviceInfoRequest) if !info_requested => {
                    info_requested = true;
                    debug!("collector requested device info");
                    channel.send(&self.config.location().to_json()?).await?;
                },
                Some(Marker::Reassign) if !reassigned => {
                    let id: DeviceId = channel.recv_str("new device id").await?.parse()?;
                    channel.send_marker(Marker::Ack).await?;
                    info!(device = %id, "collector assigned identifier");
                    self.config = self.config.with_device_id(id);
                    reassigned = true;
                },
                Some(Marker::Nack) => {
                    return Err(TelemetryError::Protocol(
                        "collector rejected the upload".to_string(),
                    ));
                },
                _ => {
                    return Err(TelemetryError::UnexpectedMarker {
                        expected: "200, 210 or 220",
                        got: String::from_utf8_lossy(&reply).into_owned(),
                    });
                },
            }
        }

        Err(TelemetryError::Protocol(
            "collector did not finish the session".to_string(),
        ))
    }

    /// Upload every payload the channel yields until it closes. Samples from
    /// a failed cycle are kept and sent with the next one.
    pub async fn run(&mut self, mut readings: ReadingChannel) -> Option<UploadReport> {
        let mut pending = TelemetryPayload::new();
        let mut last = None;

        while let Some(batch) = readings.next_payload().await {
            pending.extend(batch);
            match self.upload(&pending).await {
                Ok(report) if report.provisioning_pending => {
                    warn!("collector could not provision this device; keeping samples");
                    last = Some(report);
                },
                Ok(report) => {
                    debug!(samples = pending.len(), "upload complete");
                    pending = TelemetryPayload::new();
                    last = Some(report);
                },
                Err(e) => warn!(samples = pending.len(), "upload failed: {}", e),
            }
        }

        last
    }
}
