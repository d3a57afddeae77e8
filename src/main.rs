//! CLI Entry Point for tunnel-daq
//!
//! Provides command-line interface for:
//! - Running the acquisition loop until Ctrl-C
//! - Printing the most recent persisted records
//! - Validating the effective configuration
//!
//! # Usage
//!
//! ```bash
//! tunnel-daq run --config config/default.toml
//! tunnel-daq run --mock --wind-speed 12.5
//! tunnel-daq tail -n 20
//! tunnel-daq check-config
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tunnel_daq::acquisition::AcquisitionLoop;
use tunnel_daq::config::{SensorKind, Settings, DEFAULT_CONFIG_PATH};
use tunnel_daq::core::Record;
use tunnel_daq::data::{read_log, BufferedStore, RecordStore};
use tunnel_daq::hardware::{mock::MockTunnelSensor, SensorLink};
use tunnel_daq::logging;
use tunnel_daq::measurement::Broadcaster;

#[derive(Parser)]
#[command(name = "tunnel-daq")]
#[command(about = "Wind tunnel data acquisition service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample the sensor, broadcast and persist records until Ctrl-C
    Run {
        /// Configuration file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Use the simulated sensor regardless of the configured kind
        #[arg(long)]
        mock: bool,

        /// Initial wind speed setpoint
        #[arg(long)]
        wind_speed: Option<f64>,

        /// Start a new session file instead of appending to the configured log
        #[arg(long)]
        new_session: bool,
    },

    /// Print the most recent records of a log file
    Tail {
        /// Log file; defaults to the configured readings file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Number of records to print
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Configuration file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            mock,
            wind_speed,
            new_session,
        } => run(config, mock, wind_speed, new_session).await,
        Commands::Tail {
            file,
            count,
            config,
        } => tail(file, count, config).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

async fn run(
    config: PathBuf,
    force_mock: bool,
    wind_speed: Option<f64>,
    new_session: bool,
) -> Result<()> {
    let settings = Settings::load_from(&config)
        .with_context(|| format!("Failed to load configuration from {}", config.display()))?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    tracing::info!(
        name = %settings.application.name,
        config = %config.display(),
        "Starting acquisition service"
    );

    let sensor = build_sensor(&settings, force_mock)?;
    let store: Arc<dyn RecordStore> = Arc::new(BufferedStore::with_settings(&settings.storage));
    if new_session {
        store.new_session().await?;
    }
    let broadcaster = Arc::new(Broadcaster::with_settings(&settings.broadcast));

    let daq = AcquisitionLoop::new(
        sensor,
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        settings.acquisition.timing(),
    );
    if let Some(speed) = wind_speed {
        daq.set_wind_speed(speed)?;
    }

    let (console, mut records) = broadcaster.subscribe("console").await;
    let printer = tokio::spawn(async move {
        while let Some(message) = records.recv().await {
            match serde_json::from_str::<Record>(&message) {
                Ok(record) => tracing::info!(
                    rpm = record.rpm,
                    lift_force = record.lift_force,
                    wind_speed = record.wind_speed,
                    "Reading"
                ),
                Err(e) => tracing::warn!("Unreadable broadcast message: {}", e),
            }
        }
    });

    daq.start().await;
    tracing::info!(
        data_file = %store.location().await.display(),
        "Acquisition running, press Ctrl-C to stop"
    );

    signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    daq.stop().await;
    broadcaster.disconnect(console.id()).await;
    drop(console);
    let _ = printer.await;

    let stats = daq.stats();
    tracing::info!(
        records = stats.records,
        connection_losses = stats.connection_losses,
        store_failures = stats.store_failures,
        "Acquisition service stopped"
    );
    Ok(())
}

fn build_sensor(settings: &Settings, force_mock: bool) -> Result<Arc<dyn SensorLink>> {
    if force_mock || settings.sensor.kind == SensorKind::Mock {
        tracing::info!("Using simulated tunnel sensor");
        return Ok(Arc::new(MockTunnelSensor::new()));
    }
    serial_sensor(settings)
}

#[cfg(feature = "instrument_serial")]
fn serial_sensor(settings: &Settings) -> Result<Arc<dyn SensorLink>> {
    use tunnel_daq::hardware::arduino::ArduinoSensor;

    let port = settings
        .sensor
        .port
        .clone()
        .context("sensor.port is required for a serial sensor")?;
    tracing::info!(port = %port, baud = settings.sensor.baud_rate, "Using Arduino sensor");
    Ok(Arc::new(ArduinoSensor::new(
        port,
        settings.sensor.baud_rate,
        settings.acquisition.read_timeout,
    )))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_sensor(_settings: &Settings) -> Result<Arc<dyn SensorLink>> {
    anyhow::bail!("Serial sensor support requires the `instrument_serial` feature; use --mock")
}

async fn tail(file: Option<PathBuf>, count: usize, config: PathBuf) -> Result<()> {
    let settings = Settings::load_from(&config)?;
    let path = file.unwrap_or_else(|| settings.storage.readings_path());
    let records = read_log(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let skip = records.len().saturating_sub(count);
    for record in &records[skip..] {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn check_config(config: PathBuf) -> Result<()> {
    let settings = Settings::load_from(&config)?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    eprintln!("Configuration OK ({})", config.display());
    Ok(())
}
