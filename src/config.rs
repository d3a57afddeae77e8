//! Configuration System using Figment
//!
//! Strongly-typed settings for the acquisition service. Configuration is layered:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables prefixed with `TUNNEL_DAQ_`, nested keys split on `__`
//!
//! The core components never read configuration themselves; `main.rs` loads `Settings`
//! and passes the relevant values into each constructor.
//!
//! # Example
//! ```no_run
//! use tunnel_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Sampling every {:?}", settings.acquisition.sampling_interval);
//! # Ok::<(), tunnel_daq::error::DaqError>(())
//! ```
//!
//! Environment override example: `TUNNEL_DAQ_STORAGE__FLUSH_THRESHOLD=25`.

use crate::acquisition::AcquisitionTiming;
use crate::error::{AppResult, DaqError};
use crate::logging::LogFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Sampling loop timing
    pub acquisition: AcquisitionConfig,
    /// Instrument selection and serial parameters
    pub sensor: SensorConfig,
    /// Persisted log location and buffering
    pub storage: StorageConfig,
    /// Live subscriber delivery
    pub broadcast: BroadcastConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line layout (pretty, compact, json)
    pub log_format: LogFormat,
    /// ANSI colors in pretty/compact output
    pub log_ansi: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Wind Tunnel Data Acquisition System".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            log_ansi: true,
        }
    }
}

/// Acquisition loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Period between samples
    #[serde(with = "humantime_serde")]
    pub sampling_interval: Duration,
    /// Upper bound for a single sensor read
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Pause between reconnection attempts
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Records queued for live delivery before new ones are dropped
    pub broadcast_queue: usize,
    /// Records queued for the store before sampling waits on it
    pub store_queue: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let timing = AcquisitionTiming::default();
        Self {
            sampling_interval: timing.sampling_interval,
            read_timeout: timing.read_timeout,
            retry_interval: timing.retry_interval,
            broadcast_queue: timing.broadcast_queue,
            store_queue: timing.store_queue,
        }
    }
}

impl AcquisitionConfig {
    /// Timing parameters handed to the acquisition loop.
    pub fn timing(&self) -> AcquisitionTiming {
        AcquisitionTiming {
            sampling_interval: self.sampling_interval,
            read_timeout: self.read_timeout,
            retry_interval: self.retry_interval,
            broadcast_queue: self.broadcast_queue,
            store_queue: self.store_queue,
        }
    }
}

/// Which instrument backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Simulated instrument, no hardware required
    Mock,
    /// Arduino on a serial port
    Serial,
}

/// Instrument configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Backend selection
    pub kind: SensorKind,
    /// Serial device path (e.g. `/dev/ttyACM0`, `COM3`)
    pub port: Option<String>,
    /// Serial baud rate
    pub baud_rate: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Mock,
            port: None,
            baud_rate: 9600,
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for data files
    pub data_dir: PathBuf,
    /// Name of the initial log file inside `data_dir`
    pub readings_file: String,
    /// Pending records that trigger a rewrite of the log file
    pub flush_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            readings_file: "readings.json".to_string(),
            flush_threshold: crate::data::DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl StorageConfig {
    /// Full path of the initial log file.
    pub fn readings_path(&self) -> PathBuf {
        self.data_dir.join(&self.readings_file)
    }
}

/// Live delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Per-subscriber channel capacity for channel-backed subscribers
    pub channel_capacity: usize,
    /// A subscriber that takes longer than this to accept a record is evicted
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            send_timeout: Duration::from_secs(1),
        }
    }
}

impl Settings {
    /// Load configuration from `config/default.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TUNNEL_DAQ_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acquisition = &self.acquisition;
        for (name, value) in [
            ("sampling_interval", acquisition.sampling_interval),
            ("read_timeout", acquisition.read_timeout),
            ("retry_interval", acquisition.retry_interval),
            ("send_timeout", self.broadcast.send_timeout),
        ] {
            if value.is_zero() {
                return Err(DaqError::Configuration(format!("{name} must be > 0")));
            }
        }

        if acquisition.broadcast_queue == 0
            || acquisition.store_queue == 0
            || self.broadcast.channel_capacity == 0
        {
            return Err(DaqError::Configuration(
                "broadcast_queue, store_queue and channel_capacity must be > 0".to_string(),
            ));
        }

        if self.storage.flush_threshold == 0 {
            return Err(DaqError::Configuration(
                "flush_threshold must be > 0".to_string(),
            ));
        }

        if self.storage.readings_file.trim().is_empty() {
            return Err(DaqError::Configuration(
                "readings_file must not be empty".to_string(),
            ));
        }

        if self.sensor.kind == SensorKind::Serial && self.sensor.port.is_none() {
            return Err(DaqError::Configuration(
                "sensor.kind = \"serial\" requires sensor.port".to_string(),
            ));
        }

        Ok(())
    }
}
