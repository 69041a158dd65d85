//! Protocol markers and message bodies.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};
use crate::storage::Recording;

/// Fixed ASCII markers exchanged verbatim on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Responder opens the handshake (`199`)
    HandshakeRequest,
    /// Positive acknowledgement (`200`)
    Ack,
    /// Negative acknowledgement (`400`)
    Nack,
    /// Responder asks for device metadata (`210`)
    DeviceInfoRequest,
    /// Responder is about to assign a new identifier (`220`)
    Reassign,
}

impl Marker {
    /// Wire bytes.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Marker::HandshakeRequest => b"199",
            Marker::Ack => b"200",
            Marker::Nack => b"400",
            Marker::DeviceInfoRequest => b"210",
            Marker::Reassign => b"220",
        }
    }

    /// Wire text, for error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Marker::HandshakeRequest => "199",
            Marker::Ack => "200",
            Marker::Nack => "400",
            Marker::DeviceInfoRequest => "210",
            Marker::Reassign => "220",
        }
    }

    /// Recognize a marker frame.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        match frame {
            b"199" => Some(Marker::HandshakeRequest),
            b"200" => Some(Marker::Ack),
            b"400" => Some(Marker::Nack),
            b"210" => Some(Marker::DeviceInfoRequest),
            b"220" => Some(Marker::Reassign),
            _ => None,
        }
    }

    /// Require `frame` to be exactly this marker.
    pub fn expect(self, frame: &[u8]) -> Result<()> {
        if frame == self.as_bytes() {
            Ok(())
        } else {
            Err(TelemetryError::UnexpectedMarker {
                expected: self.as_str(),
                got: preview(frame),
            })
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short lossy rendering of an unexpected frame.
pub(crate) fn preview(frame: &[u8]) -> String {
    let shown = &frame[..frame.len().min(32)];
    String::from_utf8_lossy(shown).into_owned()
}

/// 10-digit device identifier. `0000000000` means "not yet provisioned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    /// The unconfigured sentinel.
    pub const SENTINEL: DeviceId = DeviceId(0);

    /// Largest 10-digit identifier.
    pub const MAX: u64 = 9_999_999_999;

    /// Number of characters on the wire.
    pub const WIRE_LEN: usize = 10;

    /// Wrap a numeric id.
    pub fn new(id: u64) -> Result<Self> {
        if id > Self::MAX {
            return Err(TelemetryError::InvalidDeviceId(id.to_string()));
        }
        Ok(Self(id))
    }

    /// Draw a random provisioned identifier (never the sentinel).
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen_range(1..=Self::MAX))
    }

    /// Whether this is the unconfigured sentinel.
    pub fn is_sentinel(self) -> bool {
        self == Self::SENTINEL
    }

    /// Numeric value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Storage representation.
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// From the storage representation.
    pub fn from_i64(id: i64) -> Result<Self> {
        u64::try_from(id)
            .map_err(|_| TelemetryError::InvalidDeviceId(id.to_string()))
            .and_then(Self::new)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != Self::WIRE_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TelemetryError::InvalidDeviceId(preview(s.as_bytes())));
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| TelemetryError::InvalidDeviceId(s.to_string()))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One sample of the four sensor channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelReadings {
    /// Barometric pressure
    pub pressure: f64,
    /// Temperature
    pub temperature: f64,
    /// Relative humidity
    pub humidity: f64,
    /// Illuminance (older firmware spells the key `Ligth`)
    #[serde(alias = "Ligth")]
    pub light: f64,
}

/// Samples accumulated since the last upload, keyed by epoch second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryPayload(BTreeMap<i64, ChannelReadings>);

impl TelemetryPayload {
    /// Empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample; a later sample for the same second replaces it.
    pub fn insert(&mut self, timestamp: i64, readings: ChannelReadings) {
        self.0.insert(timestamp, readings);
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no samples.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate samples in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = (&i64, &ChannelReadings)> {
        self.0.iter()
    }

    /// Merge another payload into this one.
    pub fn extend(&mut self, other: TelemetryPayload) {
        self.0.extend(other.0);
    }

    /// Decode from the wire JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode to wire JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Rows to persist for `device`.
    pub fn to_recordings(&self, device: DeviceId) -> Vec<Recording> {
        self.0
            .iter()
            .map(|(&timestamp, r)| Recording {
                timestamp,
                device_id: device.as_i64(),
                pressure: r.pressure,
                temperature: r.temperature,
                humidity: r.humidity,
                light: r.light,
            })
            .collect()
    }
}

impl FromIterator<(i64, ChannelReadings)> for TelemetryPayload {
    fn from_iter<T: IntoIterator<Item = (i64, ChannelReadings)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Device location reported during auto-provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Country code
    #[serde(rename = "Country")]
    pub country: String,
    /// City name
    #[serde(rename = "City")]
    pub city: String,
}

impl DeviceInfo {
    /// Create a location.
    pub fn new(country: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            city: city.into(),
        }
    }

    /// Decode and validate the wire JSON. Surrounding whitespace is dropped
    /// so `"Rome "` and `"Rome"` name the same location.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: Self = serde_json::from_slice(bytes)?;
        let info = Self::new(raw.country.trim(), raw.city.trim());
        if info.country.is_empty() || info.city.is_empty() {
            return Err(TelemetryError::Protocol(
                "device info has an empty field".to_string(),
            ));
        }
        Ok(info)
    }

    /// Encode to wire JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
