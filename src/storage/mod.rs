//! SQLite persistence for devices and recordings.
//!
//! A single diesel [`SqliteConnection`] sits behind a mutex and every call
//! runs on the blocking pool, so async callers never hold the runtime while
//! SQLite works and the connection is never used concurrently.
//!
//! The connection can be dropped ([`Storage::close`]) and re-established
//! ([`Storage::reopen`]); the session write path relies on the latter for its
//! single retry.

mod models;
mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use models::{DeviceRow, Recording};

use crate::protocol::{DeviceId, DeviceInfo};
use schema::{devices, recordings};

/// Random draws tried before giving up on allocating an identifier.
const ALLOCATION_ATTEMPTS: usize = 32;

/// Rows per multi-value insert (6 bound parameters each).
const INSERT_CHUNK: usize = 128;

/// Timestamps per `IN (...)` list when deleting.
const DELETE_CHUNK: usize = 512;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Could not open the database
    #[error("Cannot open database: {0}")]
    Connection(#[from] diesel::ConnectionError),

    /// Query or statement failed
    #[error("Query failed: {0}")]
    Query(#[from] diesel::result::Error),

    /// The connection has been closed
    #[error("Database connection is closed")]
    Closed,

    /// A previous holder of the connection panicked
    #[error("Database connection lock poisoned")]
    Poisoned,

    /// The blocking task did not complete
    #[error("Storage task failed: {0}")]
    Task(String),

    /// No unused identifier was found
    #[error("No free device identifier after {0} attempts")]
    Exhausted(usize),

    /// A stored value cannot be represented
    #[error("Invalid stored value: {0}")]
    InvalidRow(String),
}

/// Shared handle to the telemetry database.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    conn: Mutex<Option<SqliteConnection>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let connect_path = path.clone();
        let conn = blocking(move || connect(&connect_path)).await?;

        info!(path = %path.display(), "storage opened");
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                conn: Mutex::new(Some(conn)),
            }),
        })
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Drop the current connection (if any) and establish a new one.
    pub async fn reopen(&self) -> Result<(), StorageError> {
        let inner = Arc::clone(&self.inner);
        blocking(move || {
            let mut guard = inner.conn.lock().map_err(|_| StorageError::Poisoned)?;
            guard.take();
            *guard = Some(connect(&inner.path)?);
            Ok(())
        })
        .await?;

        debug!(path = %self.inner.path.display(), "storage reopened");
        Ok(())
    }

    /// Drop the connection. Later calls fail with [`StorageError::Closed`]
    /// until [`Storage::reopen`] succeeds.
    pub async fn close(&self) -> Result<(), StorageError> {
        let inner = Arc::clone(&self.inner);
        blocking(move || {
            inner
                .conn
                .lock()
                .map_err(|_| StorageError::Poisoned)?
                .take();
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        blocking(move || {
            let mut guard = inner.conn.lock().map_err(|_| StorageError::Poisoned)?;
            let conn = guard.as_mut().ok_or(StorageError::Closed)?;
            f(conn)
        })
        .await
    }

    /// Whether `id` is a provisioned device.
    pub async fn device_exists(&self, id: DeviceId) -> Result<bool, StorageError> {
        self.with_conn(move |conn| {
            let found = diesel::select(diesel::dsl::exists(
                devices::table.filter(devices::device_id.eq(id.as_i64())),
            ))
            .get_result(conn)?;
            Ok(found)
        })
        .await
    }

    /// Identifier already assigned to a location, if any.
    pub async fn find_device_by_location(
        &self,
        info: &DeviceInfo,
    ) -> Result<Option<DeviceId>, StorageError> {
        let DeviceInfo { country, city } = info.clone();
        let found = self
            .with_conn(move |conn| {
                let id = devices::table
                    .filter(devices::country.eq(country))
                    .filter(devices::city.eq(city))
                    .select(devices::device_id)
                    .order(devices::device_id.asc())
                    .first::<i64>(conn)
                    .optional()?;
                Ok(id)
            })
            .await?;

        found
            .map(|id| {
                DeviceId::from_i64(id)
                    .map_err(|_| StorageError::InvalidRow(format!("device id {id}")))
            })
            .transpose()
    }

    /// Allocate a fresh random identifier and register it for `info`.
    pub async fn register_device(&self, info: &DeviceInfo) -> Result<DeviceId, StorageError> {
        let DeviceInfo { country, city } = info.clone();
        self.with_conn(move |conn| {
            conn.transaction(|conn| {
                let mut rng = rand::thread_rng();
                for _ in 0..ALLOCATION_ATTEMPTS {
                    let id = DeviceId::random(&mut rng);
                    let taken: bool = diesel::select(diesel::dsl::exists(
                        devices::table.filter(devices::device_id.eq(id.as_i64())),
                    ))
                    .get_result(conn)?;
                    if taken {
                        continue;
                    }

                    diesel::insert_into(devices::table)
                        .values(DeviceRow {
                            device_id: id.as_i64(),
                            country: country.clone(),
                            city: city.clone(),
                        })
                        .execute(conn)?;
                    return Ok(id);
                }
                Err(StorageError::Exhausted(ALLOCATION_ATTEMPTS))
            })
        })
        .await
    }

    /// All provisioned devices, by identifier.
    pub async fn devices(&self) -> Result<Vec<DeviceRow>, StorageError> {
        self.with_conn(|conn| {
            let rows = devices::table
                .select(DeviceRow::as_select())
                .order(devices::device_id.asc())
                .load(conn)?;
            Ok(rows)
        })
        .await
    }

    /// Insert recordings, keeping any row already stored for the same
    /// `(timestamp, device)`. A retried write is therefore idempotent and a
    /// late reading never overwrites a retention bucket. Returns the number
    /// of rows actually inserted.
    pub async fn insert_recordings(&self, rows: Vec<Recording>) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            conn.transaction(|conn| insert_chunked(conn, &rows))
        })
        .await
    }

    /// Recordings of one device, oldest first.
    pub async fn recordings_for_device(
        &self,
        id: DeviceId,
    ) -> Result<Vec<Recording>, StorageError> {
        self.with_conn(move |conn| {
            let rows = recordings::table
                .filter(recordings::device_id.eq(id.as_i64()))
                .select(Recording::as_select())
                .order(recordings::timestamp.asc())
                .load(conn)?;
            Ok(rows)
        })
        .await
    }

    /// Devices with at least one recording in `[start, end)`.
    pub async fn devices_in_window(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<DeviceId>, StorageError> {
        let ids = self
            .with_conn(move |conn| {
                let ids = recordings::table
                    .filter(recordings::timestamp.ge(start))
                    .filter(recordings::timestamp.lt(end))
                    .select(recordings::device_id)
                    .distinct()
                    .order(recordings::device_id.asc())
                    .load::<i64>(conn)?;
                Ok(ids)
            })
            .await?;

        Ok(ids
            .into_iter()
            .filter_map(|id| match DeviceId::from_i64(id) {
                Ok(device) => Some(device),
                Err(_) => {
                    warn!(id, "skipping recordings with an invalid device id");
                    None
                },
            })
            .collect())
    }

    /// Rewrite one device's recordings in `[start, end)`.
    ///
    /// `rewrite` receives the rows oldest first and returns their
    /// replacement. Rows present in both are left alone; the rest are
    /// deleted and the new ones inserted. Load, delete and insert share one
    /// transaction, so on failure the original rows stay in place. Returns
    /// `(rows_removed, rows_written)`.
    pub async fn rewrite_window<F>(
        &self,
        id: DeviceId,
        start: i64,
        end: i64,
        rewrite: F,
    ) -> Result<(usize, usize), StorageError>
    where
        F: FnOnce(&[Recording]) -> Vec<Recording> + Send + 'static,
    {
        self.with_conn(move |conn| {
            conn.transaction(|conn| {
                let in_window = recordings::table
                    .filter(recordings::device_id.eq(id.as_i64()))
                    .filter(recordings::timestamp.ge(start))
                    .filter(recordings::timestamp.lt(end));

                let rows: Vec<Recording> = in_window
                    .clone()
                    .select(Recording::as_select())
                    .order(recordings::timestamp.asc())
                    .load(conn)?;

                let replacement = rewrite(&rows);
                let existing: HashMap<i64, &Recording> =
                    rows.iter().map(|row| (row.timestamp, row)).collect();
                let kept: HashMap<i64, &Recording> =
                    replacement.iter().map(|row| (row.timestamp, row)).collect();

                let stale: Vec<i64> = rows
                    .iter()
                    .filter(|row| kept.get(&row.timestamp) != Some(row))
                    .map(|row| row.timestamp)
                    .collect();
                let fresh: Vec<Recording> = replacement
                    .iter()
                    .filter(|row| existing.get(&row.timestamp) != Some(row))
                    .copied()
                    .collect();
                if stale.is_empty() && fresh.is_empty() {
                    return Ok((0, 0));
                }

                let mut removed = 0;
                for chunk in stale.chunks(DELETE_CHUNK) {
                    removed += diesel::delete(
                        in_window
                            .clone()
                            .filter(recordings::timestamp.eq_any(chunk)),
                    )
                    .execute(conn)?;
                }
                let written = insert_chunked(conn, &fresh)?;
                if written != fresh.len() {
                    return Err(StorageError::InvalidRow(format!(
                        "{} of {} buckets collided with kept rows",
                        fresh.len() - written,
                        fresh.len()
                    )));
                }
                Ok((removed, written))
            })
        })
        .await
    }
}

fn connect(path: &Path) -> Result<SqliteConnection, StorageError> {
    let mut conn = SqliteConnection::establish(&path.to_string_lossy())?;
    conn.batch_execute(schema::CREATE_TABLES)?;
    Ok(conn)
}

fn insert_chunked(conn: &mut SqliteConnection, rows: &[Recording]) -> Result<usize, StorageError> {
    let mut written = 0;
    for chunk in rows.chunks(INSERT_CHUNK) {
        written += diesel::insert_or_ignore_into(recordings::table)
            .values(chunk)
            .execute(conn)?;
    }
    Ok(written)
}

async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device: DeviceId, timestamp: i64, value: f64) -> Recording {
        Recording {
            timestamp,
            device_id: device.as_i64(),
            pressure: value,
            temperature: value,
            humidity: value,
            light: value,
        }
    }

    async fn open_temp() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("telemetry.db")).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_register_and_lookup_device() {
        let (_dir, storage) = open_temp().await;
        let rome = DeviceInfo::new("IT", "Rome");

        assert_eq!(storage.find_device_by_location(&rome).await.unwrap(), None);

        let id = storage.register_device(&rome).await.unwrap();
        assert!(!id.is_sentinel());
        assert!(storage.device_exists(id).await.unwrap());
        assert_eq!(
            storage.find_device_by_location(&rome).await.unwrap(),
            Some(id)
        );
        assert!(!storage.device_exists(DeviceId::SENTINEL).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let (_dir, storage) = open_temp().await;
        let id = storage
            .register_device(&DeviceInfo::new("IT", "Milan"))
            .await
            .unwrap();

        let rows: Vec<_> = (0..300).map(|i| reading(id, 1_700_000_000 + i, 1.0)).collect();
        storage.insert_recordings(rows.clone()).await.unwrap();
        storage.insert_recordings(rows).await.unwrap();

        assert_eq!(storage.recordings_for_device(id).await.unwrap().len(), 300);
        assert_eq!(storage.insert_recordings(Vec::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_late_reading_keeps_stored_row() {
        let (_dir, storage) = open_temp().await;
        let id = storage
            .register_device(&DeviceInfo::new("IT", "Genoa"))
            .await
            .unwrap();

        storage
            .insert_recordings(vec![reading(id, 1_710_493_200, 1029.5)])
            .await
            .unwrap();
        let inserted = storage
            .insert_recordings(vec![
                reading(id, 1_710_493_200, 5.0),
                reading(id, 1_710_493_260, 6.0),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = storage.recordings_for_device(id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!((rows[0].pressure - 1029.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalid_stored_device_id_is_an_error() {
        let (_dir, storage) = open_temp().await;
        storage
            .with_conn(|conn| {
                diesel::sql_query(
                    "INSERT INTO devices (device_id, country, city) VALUES (-7, 'IT', 'Rome')",
                )
                .execute(conn)?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            storage
                .find_device_by_location(&DeviceInfo::new("IT", "Rome"))
                .await,
            Err(StorageError::InvalidRow(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_key_enforced() {
        let (_dir, storage) = open_temp().await;
        let ghost = DeviceId::new(42).unwrap();
        assert!(storage
            .insert_recordings(vec![reading(ghost, 1, 1.0)])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_closed_and_reopened() {
        let (_dir, storage) = open_temp().await;
        storage.close().await.unwrap();

        assert!(matches!(
            storage.device_exists(DeviceId::SENTINEL).await,
            Err(StorageError::Closed)
        ));

        storage.reopen().await.unwrap();
        assert!(!storage.device_exists(DeviceId::SENTINEL).await.unwrap());
    }

    #[tokio::test]
    async fn test_rewrite_window_bounds() {
        let (_dir, storage) = open_temp().await;
        let id = storage
            .register_device(&DeviceInfo::new("FR", "Paris"))
            .await
            .unwrap();
        storage
            .insert_recordings(vec![
                reading(id, 99, 1.0),
                reading(id, 100, 2.0),
                reading(id, 150, 4.0),
                reading(id, 200, 8.0),
            ])
            .await
            .unwrap();

        assert_eq!(storage.devices_in_window(100, 200).await.unwrap(), vec![id]);
        assert!(storage.devices_in_window(300, 400).await.unwrap().is_empty());

        let (removed, written) = storage
            .rewrite_window(id, 100, 200, move |rows| {
                assert_eq!(rows.len(), 2);
                vec![reading(id, 100, 3.0)]
            })
            .await
            .unwrap();
        assert_eq!((removed, written), (2, 1));

        let left: Vec<i64> = storage
            .recordings_for_device(id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(left, vec![99, 100, 200]);

        let unchanged = storage
            .rewrite_window(id, 100, 200, |rows| rows.to_vec())
            .await
            .unwrap();
        assert_eq!(unchanged, (0, 0));
    }

    #[tokio::test]
    async fn test_rewrite_window_touches_only_changed_rows() {
        let (_dir, storage) = open_temp().await;
        let id = storage
            .register_device(&DeviceInfo::new("FR", "Lille"))
            .await
            .unwrap();
        storage
            .insert_recordings(vec![
                reading(id, 100, 1.0),
                reading(id, 150, 2.0),
                reading(id, 160, 3.0),
            ])
            .await
            .unwrap();

        let counts = storage
            .rewrite_window(id, 0, 1000, move |_| {
                vec![reading(id, 100, 1.0), reading(id, 150, 2.5)]
            })
            .await
            .unwrap();
        assert_eq!(counts, (2, 1));

        let rows = storage.recordings_for_device(id).await.unwrap();
        assert_eq!(rows, vec![reading(id, 100, 1.0), reading(id, 150, 2.5)]);
    }

    #[tokio::test]
    async fn test_failed_rewrite_rolls_back() {
        let (_dir, storage) = open_temp().await;
        let id = storage
            .register_device(&DeviceInfo::new("FR", "Metz"))
            .await
            .unwrap();
        let before = vec![reading(id, 100, 1.0), reading(id, 160, 3.0)];
        storage.insert_recordings(before.clone()).await.unwrap();

        let ghost = DeviceId::new(42).unwrap();
        let result = storage
            .rewrite_window(id, 0, 1000, move |_| vec![reading(ghost, 100, 2.0)])
            .await;
        assert!(matches!(result, Err(StorageError::Query(_))));
        assert_eq!(storage.recordings_for_device(id).await.unwrap(), before);
    }
}
