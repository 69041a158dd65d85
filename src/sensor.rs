//! Bridge between sensor acquisition and the upload loop.
//!
//! The acquisition side pushes [`SampleBatch`]es into a bounded channel; the
//! device client drains whatever is ready and uploads it as one payload.

use tokio::sync::mpsc;

use crate::protocol::{ChannelReadings, TelemetryPayload};

/// Default channel capacity, in batches.
pub const DEFAULT_CAPACITY: usize = 64;

/// Samples that became ready together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBatch {
    samples: TelemetryPayload,
}

impl SampleBatch {
    /// A batch with one sample.
    pub fn single(timestamp: i64, readings: ChannelReadings) -> Self {
        let mut samples = TelemetryPayload::new();
        samples.insert(timestamp, readings);
        Self { samples }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the batch holds nothing.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Unwrap into a payload.
    pub fn into_payload(self) -> TelemetryPayload {
        self.samples
    }
}

impl From<TelemetryPayload> for SampleBatch {
    fn from(samples: TelemetryPayload) -> Self {
        Self { samples }
    }
}

/// Producer half, held by the acquisition task.
#[derive(Debug, Clone)]
pub struct ReadingSender {
    tx: mpsc::Sender<SampleBatch>,
}

impl ReadingSender {
    /// Queue a batch, waiting while the channel is full. Returns `false`
    /// once the consumer is gone.
    pub async fn send(&self, batch: SampleBatch) -> bool {
        self.tx.send(batch).await.is_ok()
    }
}

/// Consumer half, held by the upload loop.
#[derive(Debug)]
pub struct ReadingChannel {
    rx: mpsc::Receiver<SampleBatch>,
}

impl ReadingChannel {
    /// Create a bounded channel.
    pub fn bounded(capacity: usize) -> (ReadingSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ReadingSender { tx }, Self { rx })
    }

    /// Wait for the next batch and merge every other batch already queued.
    /// `None` once all senders are dropped and the queue is empty.
    pub async fn next_payload(&mut self) -> Option<TelemetryPayload> {
        let mut payload = self.rx.recv().await?.into_payload();
        while let Ok(batch) = self.rx.try_recv() {
            payload.extend(batch.into_payload());
        }
        Some(payload)
    }
}
