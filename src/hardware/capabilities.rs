//! Sensor Link Capability
//!
//! The acquisition loop talks to the instrument only through [`SensorLink`]. The trait
//! owns the connection state machine:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!      ▲                          │                  │
//!      └──────────failed──────────┘                  │
//!      └──────────── read failure / disconnect() ────┘
//! ```
//!
//! # Design Philosophy
//!
//! - Async (`#[async_trait]`), thread-safe (`Send + Sync`), `&self` with interior
//!   mutability so the loop can hold it behind an `Arc`
//! - Never retries internally: pacing reconnects is the caller's job
//! - Never propagates instrument errors: a bad frame or a timeout is "no data", a broken
//!   channel is "no data" plus a transition to `Disconnected`

use async_trait::async_trait;

use super::ConnectionState;
use crate::core::RawReading;

/// Capability: connection-managed scalar instrument
///
/// # Contract
/// - `connect` moves `Disconnected → Connecting → Connected` on success and back to
///   `Disconnected` on failure; it returns whether the link is now connected
/// - `read` is bounded by the link's read timeout and returns `None` on timeout or an
///   invalid frame while staying `Connected`
/// - any channel failure during `read` forces `Disconnected` before returning `None`
/// - `disconnect` is idempotent
/// - `state` / `is_connected` have no side effects
#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Attempt to open the channel to the instrument
    async fn connect(&self) -> bool;

    /// Close the channel; always leaves the link `Disconnected`
    async fn disconnect(&self);

    /// Read one sample
    ///
    /// # Returns
    /// - `Some(reading)` on a valid frame
    /// - `None` on timeout, invalid data, or connection loss (check [`is_connected`])
    ///
    /// [`is_connected`]: SensorLink::is_connected
    async fn read(&self) -> Option<RawReading>;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// `true` only in the `Connected` state
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}
