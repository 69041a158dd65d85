#![allow(missing_docs)]

diesel::table! {
    devices (device_id) {
        device_id -> BigInt,
        country -> Text,
        city -> Text,
    }
}

diesel::table! {
    recordings (timestamp, device_id) {
        timestamp -> BigInt,
        device_id -> BigInt,
        pressure -> Double,
        temperature -> Double,
        humidity -> Double,
        light -> Double,
    }
}

diesel::joinable!(recordings -> devices (device_id));

diesel::allow_tables_to_appear_in_same_query!(devices, recordings);

/// DDL applied on every open; idempotent.
pub const CREATE_TABLES: &str = "
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
CREATE TABLE IF NOT EXISTS devices (
    device_id BIGINT PRIMARY KEY NOT NULL,
    country   TEXT NOT NULL,
    city      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS recordings (
    timestamp   BIGINT NOT NULL,
    device_id   BIGINT NOT NULL REFERENCES devices(device_id),
    pressure    DOUBLE NOT NULL,
    temperature DOUBLE NOT NULL,
    humidity    DOUBLE NOT NULL,
    light       DOUBLE NOT NULL,
    PRIMARY KEY (timestamp, device_id)
);
CREATE INDEX IF NOT EXISTS recordings_by_device ON recordings (device_id, timestamp);
";
