//! Core data types shared by the sensor link, the acquisition loop, the broadcaster and
//! the store.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One sample in instrument-native units, as returned by a [`SensorLink`].
///
/// [`SensorLink`]: crate::hardware::capabilities::SensorLink
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    /// Fan rotational speed (rev/min)
    pub rpm: f64,
    /// Lift force measured by the load cell
    pub lift_force: f64,
    /// Instrument-side validity flag
    pub is_valid: bool,
}

impl RawReading {
    /// Creates a reading flagged as valid.
    pub fn new(rpm: f64, lift_force: f64) -> Self {
        Self {
            rpm,
            lift_force,
            is_valid: true,
        }
    }
}

/// A canonical, timestamped measurement: one per successful tick.
///
/// Serialized flat; the timestamp is stored as integer milliseconds since the Unix epoch.
/// Timestamps are truncated to millisecond precision on construction so that a record read
/// back from disk compares equal to the one that was written.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Capture time (UTC)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Commanded wind speed setpoint at capture time
    #[serde(default)]
    pub wind_speed: f64,
    /// Fan rotational speed (rev/min)
    pub rpm: f64,
    /// Lift force measured by the load cell
    pub lift_force: f64,
    /// Instrument-side validity flag
    pub is_valid: bool,
}

impl Record {
    /// Attaches a capture time and the current setpoint to a raw reading.
    pub fn new(timestamp: DateTime<Utc>, wind_speed: f64, raw: RawReading) -> Self {
        Self {
            timestamp: truncate_to_millis(timestamp),
            wind_speed,
            rpm: raw.rpm,
            lift_force: raw.lift_force,
            is_valid: raw.is_valid,
        }
    }

    /// Instrument fields of this record.
    pub fn raw(&self) -> RawReading {
        RawReading {
            rpm: self.rpm,
            lift_force: self.lift_force,
            is_valid: self.is_valid,
        }
    }

    /// JSON message as delivered to live subscribers.
    pub fn to_message(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp.timestamp_millis()).unwrap_or(timestamp)
}
