//! Mock Hardware Implementations
//!
//! Simulated tunnel instrument for running the service without an Arduino attached.
//! All waits use `tokio::time::sleep`, so the mock behaves under paused test clocks.
//!
//! # Signal model
//!
//! - rpm: `base_rpm + 200·sin(0.5·t)` plus uniform noise in ±50, clamped at 0
//! - lift force: `base_lift + 2·sin(0.3·t)` plus uniform noise in ±0.5
//! - `t` advances by 0.1 per successful read
//!
//! # Fault injection
//!
//! Tests drive the acquisition loop through the failure taxonomy with:
//! - [`MockTunnelSensor::fail_next_connects`] / [`MockTunnelSensor::set_available`]
//! - [`MockTunnelSensor::return_empty_reads`] (timeouts while still connected)
//! - [`MockTunnelSensor::drop_connection`] (the next read loses the channel)

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use super::{ConnectionCell, ConnectionState, SensorLink};
use crate::core::RawReading;

/// Default simulated connection handshake time
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_millis(100);

struct Simulation {
    time: f64,
    base_rpm: f64,
    base_lift: f64,
}

impl Simulation {
    fn next_reading(&mut self) -> RawReading {
        self.time += 0.1;
        let mut rng = rand::thread_rng();

        let rpm = self.base_rpm + 200.0 * (self.time * 0.5).sin() + rng.gen_range(-50.0..50.0);
        let lift = self.base_lift + 2.0 * (self.time * 0.3).sin() + rng.gen_range(-0.5..0.5);

        RawReading::new(round_to(rpm.max(0.0), 2), round_to(lift, 3))
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Simulated wind tunnel instrument
///
/// # Example
///
/// ```rust,ignore
/// let sensor = MockTunnelSensor::new();
/// assert!(sensor.connect().await);
/// let reading = sensor.read().await.unwrap();
/// assert!(reading.rpm >= 0.0);
/// ```
pub struct MockTunnelSensor {
    state: ConnectionCell,
    sim: Mutex<Simulation>,
    connect_delay: Duration,
    available: AtomicBool,
    failing_connects: AtomicU32,
    empty_reads: AtomicU32,
    link_lost: AtomicBool,
    connect_attempts: AtomicU64,
    reads: AtomicU64,
}

impl MockTunnelSensor {
    /// Create a mock at 1000 rpm / 5.0 lift with the default connect delay
    pub fn new() -> Self {
        Self::with_base_values(1000.0, 5.0)
    }

    /// Create a mock around the given base values
    pub fn with_base_values(base_rpm: f64, base_lift: f64) -> Self {
        Self {
            state: ConnectionCell::new(),
            sim: Mutex::new(Simulation {
                time: 0.0,
                base_rpm,
                base_lift,
            }),
            connect_delay: DEFAULT_CONNECT_DELAY,
            available: AtomicBool::new(true),
            failing_connects: AtomicU32::new(0),
            empty_reads: AtomicU32::new(0),
            link_lost: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Override the simulated handshake time
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Change the base values of the simulated signal
    pub async fn set_base_values(&self, rpm: f64, lift: f64) {
        let mut sim = self.sim.lock().await;
        sim.base_rpm = rpm;
        sim.base_lift = lift;
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Plug or unplug the simulated device; while unplugged every connect fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` reads time out while staying connected
    pub fn return_empty_reads(&self, count: u32) {
        self.empty_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next read fail with a broken channel
    pub fn drop_connection(&self) {
        self.link_lost.store(true, Ordering::SeqCst);
    }

    /// Number of `connect()` calls so far
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of `read()` calls so far, including empty ones
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockTunnelSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorLink for MockTunnelSensor {
    fn name(&self) -> &str {
        "mock-tunnel"
    }

    async fn connect(&self) -> bool {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.state.set(ConnectionState::Connecting);

        if !self.connect_delay.is_zero() {
            sleep(self.connect_delay).await;
        }

        let refused = Self::take_one(&self.failing_connects);
        if refused || !self.available.load(Ordering::SeqCst) {
            self.state.set(ConnectionState::Disconnected);
            tracing::debug!("Mock sensor refused connection");
            return false;
        }

        self.link_lost.store(false, Ordering::SeqCst);
        self.state.set(ConnectionState::Connected);
        tracing::info!("Mock sensor connected");
        true
    }

    async fn disconnect(&self) {
        if self.state.set(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            tracing::info!("Mock sensor disconnected");
        }
    }

    async fn read(&self) -> Option<RawReading> {
        if !self.is_connected() {
            return None;
        }
        self.reads.fetch_add(1, Ordering::SeqCst);

        if self.link_lost.swap(false, Ordering::SeqCst) {
            self.state.set(ConnectionState::Disconnected);
            tracing::warn!("Mock sensor lost its connection");
            return None;
        }

        if Self::take_one(&self.empty_reads) {
            return None;
        }

        Some(self.sim.lock().await.next_reading())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
