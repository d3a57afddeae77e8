//! Arduino Tunnel Instrument Driver
//!
//! Protocol Overview:
//! - The sketch streams one ASCII line per sample (see [`super::frame`])
//! - Default baud: 9600, 8N1, no flow control
//! - Terminator: LF (\n), CR tolerated
//!
//! # Important Notes
//!
//! - Opening the port resets most Arduino boards; the first lines after `connect()` are
//!   often a boot banner and are reported as "no data" by the parser
//! - A read that times out leaves the link connected and keeps the bytes of the unfinished
//!   line for the next read; EOF or an I/O error closes it
//!
//! # Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tunnel_daq::hardware::{arduino::ArduinoSensor, SensorLink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let sensor = ArduinoSensor::new("/dev/ttyACM0", 9600, Duration::from_secs(1));
//!     if sensor.connect().await {
//!         println!("{:?}", sensor.read().await);
//!     }
//! }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::frame::{parse_frame, LineRead, LineReader};
use super::{ConnectionCell, ConnectionState, SensorLink};
use crate::core::RawReading;
use crate::error::{AppResult, DaqError};

type PortReader = LineReader<BufReader<SerialStream>>;

/// Driver for the tunnel's Arduino data logger
pub struct ArduinoSensor {
    port_path: String,
    baud_rate: u32,
    read_timeout: Duration,
    state: ConnectionCell,
    /// Open port, `None` while disconnected
    port: Mutex<Option<PortReader>>,
}

impl ArduinoSensor {
    /// Create a driver for the given port; nothing is opened until `connect()`
    ///
    /// # Arguments
    /// * `port_path` - Serial port path (e.g., "/dev/ttyACM0", "COM3")
    /// * `baud_rate` - Line speed configured in the sketch
    /// * `read_timeout` - Upper bound for one `read()`
    pub fn new(port_path: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate,
            read_timeout,
            state: ConnectionCell::new(),
            port: Mutex::new(None),
        }
    }

    fn open(&self) -> AppResult<SerialStream> {
        tokio_serial::new(&self.port_path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::Instrument(format!("cannot open '{}': {}", self.port_path, e))
            })
    }

    fn mark_lost(&self, port: &mut Option<PortReader>, reason: &str) {
        port.take();
        self.state.set(ConnectionState::Disconnected);
        tracing::warn!(port = %self.port_path, "Arduino connection lost: {}", reason);
    }
}

#[async_trait]
impl SensorLink for ArduinoSensor {
    fn name(&self) -> &str {
        &self.port_path
    }

    async fn connect(&self) -> bool {
        let mut port = self.port.lock().await;
        self.state.set(ConnectionState::Connecting);

        match self.open() {
            Ok(stream) => {
                *port = Some(LineReader::new(BufReader::new(stream)));
                self.state.set(ConnectionState::Connected);
                tracing::info!(
                    port = %self.port_path,
                    baud = self.baud_rate,
                    "Arduino connected"
                );
                true
            }
            Err(e) => {
                *port = None;
                self.state.set(ConnectionState::Disconnected);
                tracing::warn!(recoverable = e.can_recover(), "Arduino connect failed: {}", e);
                false
            }
        }
    }

    async fn disconnect(&self) {
        let mut port = self.port.lock().await;
        if port.take().is_some() {
            tracing::info!(port = %self.port_path, "Arduino disconnected");
        }
        self.state.set(ConnectionState::Disconnected);
    }

    async fn read(&self) -> Option<RawReading> {
        let mut port = self.port.lock().await;
        let reader = port.as_mut()?;

        match reader.read_line(self.read_timeout).await {
            LineRead::TimedOut => {
                tracing::debug!(
                    port = %self.port_path,
                    partial_bytes = reader.pending(),
                    "Arduino read timeout"
                );
                None
            }
            LineRead::Closed => {
                self.mark_lost(&mut port, "end of stream");
                None
            }
            LineRead::Failed(e) => {
                self.mark_lost(&mut port, &e.to_string());
                None
            }
            LineRead::Line(line) => {
                let reading = parse_frame(&line);
                if reading.is_none() {
                    tracing::debug!(port = %self.port_path, line = line.trim(), "Ignoring invalid frame");
                }
                reading
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}
