//! Tracing Infrastructure
//!
//! Installs the global `tracing` subscriber for the acquisition service from the
//! `[application]` settings section:
//!
//! ```toml
//! [application]
//! log_level = "info"      # overridden by RUST_LOG when set
//! log_format = "compact"  # pretty | compact | json
//! log_ansi = true         # colors for pretty/compact output
//! ```
//!
//! # Example
//! ```no_run
//! use tunnel_daq::{config::Settings, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!(component = "sensor", "Acquisition service started");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer,
    Registry,
};

/// Log line layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented (development)
    Pretty,
    /// One line per event (unattended runs)
    #[default]
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

/// Resolved subscriber options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Line layout
    pub format: LogFormat,
    /// ANSI colors (ignored for JSON)
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            ansi: true,
        }
    }
}

impl TracingConfig {
    /// Options from the `[application]` section
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let application = &settings.application;
        Ok(Self {
            level: parse_log_level(&application.log_level)?,
            format: application.log_format,
            ansi: application.log_ansi,
        })
    }
}

/// Initialize tracing from the loaded settings
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` if a global subscriber is already installed (tests, embedding
/// applications).
pub fn init(config: TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(output_layer(config))
        .with(filter)
        .try_init()
        .or_else(already_initialized_is_ok)
}

fn output_layer(config: TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    match config.format {
        LogFormat::Pretty => fmt::layer().pretty().with_ansi(config.ansi).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_ansi(config.ansi).boxed(),
        LogFormat::Json => fmt::layer().json().with_ansi(false).boxed(),
    }
}

fn already_initialized_is_ok(err: TryInitError) -> Result<(), String> {
    if err
        .to_string()
        .contains("a global default trace dispatcher has already been set")
    {
        Ok(())
    } else {
        Err(format!("Failed to initialize tracing: {}", err))
    }
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
