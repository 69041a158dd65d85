//! Background persistence of session payloads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, error, warn, Instrument};

use crate::protocol::DeviceId;
use crate::storage::{Recording, Storage};

/// Tracks fire-and-forget writes so shutdown can wait for them.
#[derive(Debug, Clone, Default)]
pub struct WriteTracker {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl WriteTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `rows` in the background, reopening storage and retrying once
    /// on failure.
    pub fn spawn_write(&self, storage: Storage, device: DeviceId, rows: Vec<Recording>) {
        let span = tracing::Span::current();
        self.tasks()
            .spawn(persist(storage, device, rows).instrument(span));
    }

    /// Writes not yet collected.
    pub fn pending(&self) -> usize {
        self.tasks().len()
    }

    /// Collect finished writes without waiting. Returns how many were reaped.
    pub fn reap(&self) -> usize {
        let mut tasks = self.tasks();
        let mut reaped = 0;
        while let Some(result) = tasks.try_join_next() {
            log_join(result);
            reaped += 1;
        }
        reaped
    }

    /// Wait for every outstanding write, including ones spawned meanwhile.
    pub async fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            let mut batch = std::mem::take(&mut *self.tasks());
            if batch.is_empty() {
                return drained;
            }
            while let Some(result) = batch.join_next().await {
                log_join(result);
                drained += 1;
            }
        }
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!("write task failed: {}", e);
    }
}

async fn persist(storage: Storage, device: DeviceId, rows: Vec<Recording>) {
    let count = rows.len();

    let first = match storage.insert_recordings(rows.clone()).await {
        Ok(stored) => {
            debug!(%device, count, stored, "recordings stored");
            return;
        },
        Err(e) => e,
    };

    warn!(%device, "write failed, reopening storage: {}", first);
    if let Err(e) = storage.reopen().await {
        error!(%device, count, "recordings lost, storage reopen failed: {}", e);
        return;
    }

    match storage.insert_recordings(rows).await {
        Ok(_) => debug!(%device, count, "recordings stored after retry"),
        Err(e) => error!(%device, count, "recordings lost after retry: {}", e),
    }
}
