//! Instrument connection layer.
//!
//! - [`capabilities::SensorLink`]: the port the acquisition loop drives
//! - [`mock::MockTunnelSensor`]: simulated tunnel instrument with fault injection
//! - [`frame`]: parser for the instrument's ASCII line protocol
//! - `arduino::ArduinoSensor`: serial driver (feature `instrument_serial`)

pub mod capabilities;
pub mod frame;
pub mod mock;

#[cfg(feature = "instrument_serial")]
pub mod arduino;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

pub use capabilities::SensorLink;

/// Connection state of a sensor link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No channel to the instrument (initial state)
    Disconnected,
    /// `connect()` in progress
    Connecting,
    /// Channel open, reads allowed
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Lock-free holder for a [`ConnectionState`], so `state()` can be queried synchronously
/// while a driver's async operations own the channel.
#[derive(Debug)]
pub struct ConnectionCell(AtomicU8);

impl ConnectionCell {
    /// Starts `Disconnected`.
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Replaces the state, returning the previous one.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        let raw = match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        };
        match self.0.swap(raw, Ordering::AcqRel) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl Default for ConnectionCell {
    fn default() -> Self {
        Self::new()
    }
}
