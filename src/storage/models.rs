use diesel::prelude::*;

use super::schema::{devices, recordings};

/// A provisioned device.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Insertable)]
#[diesel(table_name = devices)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeviceRow {
    /// Numeric identifier
    pub device_id: i64,
    /// Country code
    pub country: String,
    /// City name
    pub city: String,
}

/// One telemetry row, raw or bucketed.
#[derive(Debug, Clone, Copy, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = recordings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Recording {
    /// Epoch seconds
    pub timestamp: i64,
    /// Owning device
    pub device_id: i64,
    /// Pressure
    pub pressure: f64,
    /// Temperature
    pub temperature: f64,
    /// Humidity
    pub humidity: f64,
    /// Light
    pub light: f64,
}
