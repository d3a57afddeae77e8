//! # Tunnel DAQ Core Library
//!
//! Data acquisition for a wind tunnel instrument: the crate samples a sensor at a fixed
//! rate, stamps every sample into a [`Record`](core::Record), fans records out live to any
//! number of subscribers and appends them to a buffered JSON log. The `tunnel-daq` binary
//! wires these pieces together; an API layer can do the same by sharing one
//! [`AcquisitionLoop`](acquisition::AcquisitionLoop).
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The fixed-rate loop that owns sensor, broadcaster and store
//!   lifecycles, plus the wind-speed setpoint and recording toggle.
//! - **`config`**: Layered `figment` settings (defaults, TOML file, `TUNNEL_DAQ_*` env vars).
//! - **`core`**: `RawReading` and `Record`, the data that flows through the pipeline.
//! - **`data`**: The `RecordStore` port and the write-batching `BufferedStore`.
//! - **`error`**: The `DaqError` enum shared across the crate.
//! - **`hardware`**: The `SensorLink` port, the simulated tunnel sensor and the Arduino driver
//!   (feature `instrument_serial`).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`measurement`**: The `Broadcaster` delivering records to live subscribers.

pub mod acquisition;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement;
