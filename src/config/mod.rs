//! Configuration management.
//!
//! Settings are layered, later sources winning:
//! - built-in defaults
//! - TOML config file (`--config`, or `<config dir>/field-telemetry/config.toml`)
//! - `TELEMETRY_*` environment variables
//! - CLI flags (applied by the binary)
//!
//! The result is validated once and shared read-only as `Arc<Config>`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::KeySize;
use crate::error::{Result, TelemetryError};
use crate::protocol::{DeviceId, DeviceInfo, DEFAULT_READ_TIMEOUT, MAX_FRAME_BYTES};

/// Directory name under the platform config dir.
pub const CONFIG_DIR_NAME: &str = "field-telemetry";

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Collector listener and session settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Database location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Downsampling schedule
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Device-side settings
    #[serde(default)]
    pub device: DeviceConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TelemetryError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| TelemetryError::Config(format!("Failed to parse config: {e}")))
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults, then `path` (or the default file when present), then env.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_path().filter(|p| p.is_file()) {
                Some(path) => {
                    tracing::debug!(path = %path.display(), "using default config file");
                    Self::from_file(path)?
                },
                None => Self::default(),
            },
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `TELEMETRY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("TELEMETRY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("TELEMETRY_PORT") {
            let port = port
                .parse()
                .map_err(|_| TelemetryError::Config(format!("Invalid TELEMETRY_PORT: {port}")))?;
            self.server.port = port;
            self.device.port = port;
        }
        if let Some(bits) = lookup("TELEMETRY_KEY_SIZE") {
            self.server.key_size = bits.parse().map_err(|_| {
                TelemetryError::Config(format!("Invalid TELEMETRY_KEY_SIZE: {bits}"))
            })?;
        }
        if let Some(database) = lookup("TELEMETRY_DATABASE") {
            self.storage.database = PathBuf::from(database);
        }
        if let Some(id) = lookup("TELEMETRY_DEVICE_ID") {
            self.device.device_id = id.parse()?;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.server.key_size()?;
        if self.server.max_frame_bytes == 0 {
            return Err(TelemetryError::Config(
                "server.max_frame_bytes must be positive".to_string(),
            ));
        }
        if self.retention.period_secs == 0 {
            return Err(TelemetryError::Config(
                "retention.period_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<config dir>/field-telemetry/config.toml`, when a config dir exists.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join("config.toml"))
}

/// Collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// RSA modulus size offered in the handshake
    pub key_size: u32,

    /// Per-read deadline in seconds
    pub read_timeout_secs: u64,

    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,

    /// Delay before retrying a failed startup, in seconds
    pub startup_retry_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
            key_size: KeySize::DEFAULT.bits(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT.as_secs(),
            max_frame_bytes: MAX_FRAME_BYTES,
            startup_retry_secs: 120,
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validated RSA key size.
    pub fn key_size(&self) -> Result<KeySize> {
        Ok(KeySize::new(self.key_size)?)
    }

    /// Per-read deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Startup backoff.
    pub fn startup_retry(&self) -> Duration {
        Duration::from_secs(self.startup_retry_secs)
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("telemetry.db"),
        }
    }
}

/// Retention configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Run the downsampling job at all
    pub enabled: bool,

    /// Seconds between passes
    pub period_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_secs: 24 * 60 * 60,
        }
    }
}

impl RetentionConfig {
    /// Interval between passes.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Device-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Collector host
    pub server: String,

    /// Collector port
    pub port: u16,

    /// Identifier assigned by the collector (`0000000000` until provisioned)
    pub device_id: DeviceId,

    /// Country code reported when the collector asks
    pub country: String,

    /// City name reported when the collector asks
    pub city: String,

    /// Per-read deadline in seconds
    pub read_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: 1234,
            device_id: DeviceId::SENTINEL,
            country: String::new(),
            city: String::new(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT.as_secs(),
        }
    }
}

impl DeviceConfig {
    /// Collector address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Location reported on a device info request.
    pub fn location(&self) -> DeviceInfo {
        DeviceInfo::new(self.country.clone(), self.city.clone())
    }

    /// Per-read deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Snapshot with the identifier the collector assigned.
    pub fn with_device_id(&self, device_id: DeviceId) -> Self {
        Self {
            device_id,
            ..self.clone()
        }
    }
}
