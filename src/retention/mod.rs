//! Retention and downsampling of historical recordings.
//!
//! Raw recordings are periodically replaced by per-device time-bucket
//! averages. Three tiers run in a fixed order on each pass:
//!
//! | Tier    | Runs on     | Window   | Reaches back | Trailing exclusion | Bucket |
//! |---------|-------------|----------|--------------|--------------------|--------|
//! | `Year`  | January 1   | 365 days | 365 days     | 30 days            | 12 h   |
//! | `Month` | day 1       | 30 days  | 365 days     | 24 h               | 4 h    |
//! | `Day`   | every pass  | 24 h     | 30 days      | none               | 1 h    |
//!
//! A tier scans back to the horizon of the next coarser tier rather than
//! just its nominal window. Rows an earlier pass missed, such as late uploads
//! or the gap left by a pass that started late, are picked up by the next one.
//!
//! Window edges are aligned to the tier's bucket width, so a bucket never
//! straddles a window boundary. Coarser buckets already sit on finer
//! boundaries, so rescanning them is a no-op, as is a second pass over
//! already-bucketed data.
//!
//! Each device's window is rewritten in one transaction. A failure leaves
//! that device's raw rows untouched, is counted in the [`RetentionReport`]
//! and the pass moves on to the next device.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::RetentionConfig;
use crate::storage::{Recording, Storage};

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// Downsampling tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Last 24 hours into hourly buckets
    Day,
    /// Previous 30 days (minus the last day) into 4 hour buckets
    Month,
    /// Previous year (minus the last 30 days) into 12 hour buckets
    Year,
}

impl Tier {
    /// Window width in seconds.
    pub fn window_width(self) -> i64 {
        match self {
            Tier::Day => DAY,
            Tier::Month => 30 * DAY,
            Tier::Year => 365 * DAY,
        }
    }

    /// How far back a pass scans, in seconds: the next coarser tier's window.
    pub fn lookback(self) -> i64 {
        match self {
            Tier::Day => Tier::Month.window_width(),
            Tier::Month | Tier::Year => Tier::Year.window_width(),
        }
    }

    /// Most recent span left untouched, in seconds.
    pub fn trailing_exclusion(self) -> i64 {
        match self {
            Tier::Day => 0,
            Tier::Month => DAY,
            Tier::Year => 30 * DAY,
        }
    }

    /// Bucket width in seconds.
    pub fn bucket_width(self) -> i64 {
        match self {
            Tier::Day => HOUR,
            Tier::Month => 4 * HOUR,
            Tier::Year => 12 * HOUR,
        }
    }

    /// Half-open window `[start, end)` in epoch seconds for a pass at `now`.
    pub fn window(self, now: i64) -> (i64, i64) {
        let aligned = truncate(now, self.bucket_width());
        (
            aligned - self.lookback(),
            aligned - self.trailing_exclusion(),
        )
    }

    /// Tiers due on `date`, in execution order.
    pub fn due_on(date: NaiveDate) -> Vec<Tier> {
        let mut tiers = Vec::with_capacity(3);
        if date.month() == 1 && date.day() == 1 {
            tiers.push(Tier::Year);
        }
        if date.day() == 1 {
            tiers.push(Tier::Month);
        }
        tiers.push(Tier::Day);
        tiers
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Day => "day",
            Tier::Month => "month",
            Tier::Year => "year",
        };
        f.write_str(name)
    }
}

/// Round `timestamp` down to a multiple of `width` (relative to the epoch).
pub fn truncate(timestamp: i64, width: i64) -> i64 {
    timestamp - timestamp.rem_euclid(width)
}

/// Average `rows` into buckets of `width` seconds.
///
/// Rows may arrive in any order and are assumed to belong to one device.
/// Each bucket starts at the first reading's timestamp truncated to `width`
/// and carries the per-channel mean of the readings that fall inside it.
pub fn bucketize(rows: &[Recording], width: i64) -> Vec<Recording> {
    let mut sorted = rows.to_vec();
    sorted.sort_by_key(|r| r.timestamp);

    let mut buckets = Vec::new();
    let mut acc: Option<Accumulator> = None;

    for row in &sorted {
        match acc.as_mut() {
            Some(open) if row.timestamp < open.start + width => open.add(row),
            _ => {
                if let Some(done) = acc.take() {
                    buckets.push(done.finish());
                }
                acc = Some(Accumulator::new(truncate(row.timestamp, width), row));
            },
        }
    }
    if let Some(done) = acc {
        buckets.push(done.finish());
    }

    buckets
}

struct Accumulator {
    start: i64,
    device_id: i64,
    count: usize,
    pressure: f64,
    temperature: f64,
    humidity: f64,
    light: f64,
}

impl Accumulator {
    fn new(start: i64, first: &Recording) -> Self {
        let mut acc = Self {
            start,
            device_id: first.device_id,
            count: 0,
            pressure: 0.0,
            temperature: 0.0,
            humidity: 0.0,
            light: 0.0,
        };
        acc.add(first);
        acc
    }

    fn add(&mut self, row: &Recording) {
        self.count += 1;
        self.pressure += row.pressure;
        self.temperature += row.temperature;
        self.humidity += row.humidity;
        self.light += row.light;
    }

    fn finish(self) -> Recording {
        let n = self.count as f64;
        Recording {
            timestamp: self.start,
            device_id: self.device_id,
            pressure: self.pressure / n,
            temperature: self.temperature / n,
            humidity: self.humidity / n,
            light: self.light / n,
        }
    }
}

/// Outcome of one tier within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierReport {
    /// Tier that ran
    pub tier: Tier,
    /// Devices whose window was rewritten
    pub devices_compacted: usize,
    /// Devices whose rewrite failed and was rolled back
    pub devices_failed: usize,
    /// Raw rows deleted
    pub rows_removed: usize,
    /// Bucket rows written
    pub buckets_written: usize,
}

impl TierReport {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            devices_compacted: 0,
            devices_failed: 0,
            rows_removed: 0,
            buckets_written: 0,
        }
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Per-tier results, in execution order
    pub tiers: Vec<TierReport>,
    /// Whether the pass stopped early on cancellation
    pub cancelled: bool,
}

impl RetentionReport {
    /// Result for one tier, if it ran.
    pub fn tier(&self, tier: Tier) -> Option<&TierReport> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    /// Total failed device rewrites across tiers.
    pub fn failures(&self) -> usize {
        self.tiers.iter().map(|t| t.devices_failed).sum()
    }
}

/// Scheduled downsampling job.
#[derive(Debug, Clone)]
pub struct RetentionEngine {
    storage: Storage,
    period: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl RetentionEngine {
    /// Create an engine with the configured period.
    pub fn new(storage: Storage, config: &RetentionConfig) -> Self {
        Self {
            storage,
            period: config.period(),
            cancel: None,
        }
    }

    /// Stop between devices once `cancel` turns `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run every tier due at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport::default();

        for tier in Tier::due_on(now.date_naive()) {
            let (tier_report, finished) = self.run_tier(tier, now.timestamp()).await;
            info!(
                %tier,
                compacted = tier_report.devices_compacted,
                failed = tier_report.devices_failed,
                removed = tier_report.rows_removed,
                written = tier_report.buckets_written,
                "retention tier finished"
            );
            report.tiers.push(tier_report);

            if !finished {
                report.cancelled = true;
                break;
            }
        }

        report
    }

    async fn run_tier(&self, tier: Tier, now: i64) -> (TierReport, bool) {
        let mut report = TierReport::new(tier);
        let (start, end) = tier.window(now);
        let width = tier.bucket_width();

        let devices = match self.storage.devices_in_window(start, end).await {
            Ok(devices) => devices,
            Err(e) => {
                error!(%tier, "cannot list devices for retention: {}", e);
                return (report, true);
            },
        };
        debug!(%tier, start, end, devices = devices.len(), "retention window");

        for device in devices {
            if self.is_cancelled() {
                return (report, false);
            }

            match self
                .storage
                .rewrite_window(device, start, end, move |rows| bucketize(rows, width))
                .await
            {
                Ok((0, 0)) => {},
                Ok((removed, written)) => {
                    report.devices_compacted += 1;
                    report.rows_removed += removed;
                    report.buckets_written += written;
                },
                Err(e) => {
                    report.devices_failed += 1;
                    error!(%tier, %device, "retention rolled back: {}", e);
                },
            }

            tokio::task::yield_now().await;
        }

        (report, true)
    }

    /// Run a pass now and then every period until cancelled.
    pub async fn run(self) {
        let mut cancel = self.cancel.clone();
        loop {
            if self.is_cancelled() {
                break;
            }
            let report = self.run_once(Utc::now()).await;
            if report.cancelled {
                break;
            }

            match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.period) => {},
                        changed = rx.changed() => {
                            // A dropped sender also means stop.
                            if changed.is_err() || *rx.borrow() {
                                break;
                            }
                        },
                    }
                },
                None => tokio::time::sleep(self.period).await,
            }
        }
        debug!("retention task stopped");
    }
}
