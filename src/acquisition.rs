//! Acquisition loop.
//!
//! Drives a [`SensorLink`] at a fixed rate, turns every reading into a [`Record`], queues
//! it for live delivery through the [`Broadcaster`] and, while recording, queues it for the
//! [`RecordStore`].
//!
//! ```text
//! ┌────────────┐  read   ┌─────────────────┐  try_send  ┌───────────────┐
//! │ SensorLink │ ──────▶ │ AcquisitionLoop │ ─────────▶ │ delivery task │ ──▶ Broadcaster
//! └────────────┘         └─────────────────┘            └───────────────┘
//!                                 │ send (when recording)
//!                                 ▼
//!                         ┌───────────────┐  append
//!                         │  store task   │ ───────▶ RecordStore
//!                         └───────────────┘
//! ```
//!
//! A slow subscriber costs live records (the delivery queue drops when full). A slow store
//! costs nothing until its queue is full; only then does sampling wait for it, so accepted
//! records are never lost on the way to the store.
//!
//! Pacing per tick, measured from the start of the tick:
//! - reading accepted or no data while connected: `sampling_interval`
//! - connect failed or connection lost: `retry_interval`
//!
//! Failures never end the loop. Only [`AcquisitionLoop::stop`] does.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::core::{RawReading, Record};
use crate::data::RecordStore;
use crate::error::{AppResult, DaqError};
use crate::hardware::{ConnectionState, SensorLink};
use crate::measurement::Broadcaster;

/// Timing parameters of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionTiming {
    /// Period between ticks while the sensor delivers (or times out normally)
    pub sampling_interval: Duration,
    /// Upper bound the loop puts on a single `read()`
    pub read_timeout: Duration,
    /// Pause after a failed connect or a lost connection
    pub retry_interval: Duration,
    /// Records waiting for live delivery before new ones are dropped
    pub broadcast_queue: usize,
    /// Records waiting for the store before sampling waits on it
    pub store_queue: usize,
}

impl Default for AcquisitionTiming {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(5),
            broadcast_queue: 256,
            store_queue: 1024,
        }
    }
}

/// Snapshot of the loop counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionStats {
    /// Loop iterations started
    pub ticks: u64,
    /// Records built from sensor readings
    pub records: u64,
    /// Reads that returned no data while the link stayed up
    pub empty_reads: u64,
    /// Failed `connect()` attempts
    pub connect_failures: u64,
    /// Reads that ended with the link down
    pub connection_losses: u64,
    /// Appends that returned an error
    pub store_failures: u64,
    /// Records not queued for live delivery because the queue was full
    pub dropped_broadcasts: u64,
}

/// Snapshot of the whole pipeline for status queries
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Sensor link name
    pub sensor: String,
    /// Link state as reported by the sensor
    pub sensor_state: ConnectionState,
    /// Shorthand for `sensor_state == Connected`
    pub sensor_connected: bool,
    /// Whether the loop is started
    pub running: bool,
    /// Whether records are appended to the store
    pub recording: bool,
    /// Current setpoint
    pub wind_speed: f64,
    /// Registered live subscribers
    pub subscribers: usize,
    /// Records not yet flushed
    pub pending_records: usize,
    /// Current store target
    pub data_file: PathBuf,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    records: AtomicU64,
    empty_reads: AtomicU64,
    connect_failures: AtomicU64,
    connection_losses: AtomicU64,
    store_failures: AtomicU64,
    dropped_broadcasts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AcquisitionStats {
        AcquisitionStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connection_losses: self.connection_losses.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            dropped_broadcasts: self.dropped_broadcasts.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    sensor: Arc<dyn SensorLink>,
    store: Arc<dyn RecordStore>,
    broadcaster: Arc<Broadcaster>,
    timing: AcquisitionTiming,
    /// Setpoint as `f64` bits
    wind_speed: AtomicU64,
    recording: AtomicBool,
    running: AtomicBool,
    /// Last issued record timestamp in ms, `i64::MIN` before the first one
    last_timestamp: AtomicI64,
    counters: Counters,
}

impl Shared {
    fn wind_speed(&self) -> f64 {
        f64::from_bits(self.wind_speed.load(Ordering::SeqCst))
    }

    /// Wall clock, clamped so timestamps never go backwards.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let ms = now.timestamp_millis();
        let previous = self.last_timestamp.fetch_max(ms, Ordering::SeqCst);
        if previous <= ms {
            return now;
        }
        tracing::debug!(
            behind_ms = previous - ms,
            "Wall clock stepped backwards, reusing last timestamp"
        );
        Utc.timestamp_millis_opt(previous).single().unwrap_or(now)
    }

    /// Run one tick and return the delay before the next one.
    async fn tick(&self, queues: &Queues) -> Duration {
        Counters::bump(&self.counters.ticks);

        if !self.sensor.is_connected() {
            if !self.sensor.connect().await {
                Counters::bump(&self.counters.connect_failures);
                tracing::warn!(
                    sensor = self.sensor.name(),
                    retry_in = ?self.timing.retry_interval,
                    "Failed to connect to sensor"
                );
                return self.timing.retry_interval;
            }
            tracing::info!(sensor = self.sensor.name(), "Sensor link established");
        }

        let Some(raw) = self.read().await else {
            if self.sensor.is_connected() {
                Counters::bump(&self.counters.empty_reads);
                return self.timing.sampling_interval;
            }
            Counters::bump(&self.counters.connection_losses);
            tracing::warn!(
                sensor = self.sensor.name(),
                retry_in = ?self.timing.retry_interval,
                "Sensor connection lost"
            );
            return self.timing.retry_interval;
        };

        self.accept(raw, queues).await;
        self.timing.sampling_interval
    }

    async fn read(&self) -> Option<RawReading> {
        match tokio::time::timeout(self.timing.read_timeout, self.sensor.read()).await {
            Ok(reading) => reading,
            Err(_) => {
                tracing::debug!(
                    sensor = self.sensor.name(),
                    timeout = ?self.timing.read_timeout,
                    "Sensor read timed out"
                );
                None
            }
        }
    }

    async fn accept(&self, raw: RawReading, queues: &Queues) {
        let record = Record::new(self.next_timestamp(), self.wind_speed(), raw);
        Counters::bump(&self.counters.records);

        if let Err(e) = queues.deliveries.try_send(record) {
            Counters::bump(&self.counters.dropped_broadcasts);
            tracing::debug!("Dropped record for live delivery: {}", e);
        }

        if !self.recording.load(Ordering::SeqCst) {
            return;
        }

        match queues.appends.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::warn!(
                    queued = self.timing.store_queue,
                    "Store queue full, sampling waits for the store"
                );
                if queues.appends.send(record).await.is_err() {
                    self.store_task_gone();
                }
            }
            Err(TrySendError::Closed(_)) => self.store_task_gone(),
        }
    }

    fn store_task_gone(&self) {
        Counters::bump(&self.counters.store_failures);
        tracing::error!("Store task is gone, record not persisted");
    }

    async fn append(&self, record: Record) {
        let started = Instant::now();
        match self.store.append(record).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                if elapsed > self.timing.sampling_interval {
                    tracing::debug!(elapsed = ?elapsed, "Slow store append");
                }
            }
            Err(e) if e.can_recover() => {
                Counters::bump(&self.counters.store_failures);
                tracing::warn!("Failed to persist record, keeping it buffered: {}", e);
            }
            Err(e) => {
                Counters::bump(&self.counters.store_failures);
                tracing::error!("Store rejected record: {}", e);
            }
        }
    }
}

/// Producer ends of the per-run queues, owned by the sampling task
struct Queues {
    deliveries: mpsc::Sender<Record>,
    appends: mpsc::Sender<Record>,
}

struct Runner {
    shutdown: watch::Sender<bool>,
    sampler: JoinHandle<()>,
    delivery: JoinHandle<()>,
    persistence: JoinHandle<()>,
}

async fn sample(shared: Arc<Shared>, queues: Queues, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(sensor = shared.sensor.name(), "Acquisition loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let started = Instant::now();
        let delay = shared.tick(&queues).await;

        tokio::select! {
            _ = sleep_until(started + delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("Acquisition loop finished");
}

/// Appends queued records in order until the sampler drops its sender.
async fn persist(shared: Arc<Shared>, mut queue: mpsc::Receiver<Record>) {
    while let Some(record) = queue.recv().await {
        shared.append(record).await;
    }
}

async fn deliver(broadcaster: Arc<Broadcaster>, mut queue: mpsc::Receiver<Record>) {
    while let Some(record) = queue.recv().await {
        let report = broadcaster.broadcast(&record).await;
        if !report.evicted.is_empty() {
            tracing::debug!(
                delivered = report.delivered,
                evicted = report.evicted.len(),
                "Broadcast evicted subscribers"
            );
        }
    }
}

/// Orchestrates sensor, broadcaster and store.
///
/// Constructed by the process entry point and shared by `Arc`. Lifecycle calls are
/// idempotent and the loop can be started again after a stop.
pub struct AcquisitionLoop {
    shared: Arc<Shared>,
    runner: Mutex<Option<Runner>>,
}

impl AcquisitionLoop {
    /// Wire the pipeline; nothing runs until [`start`](Self::start).
    pub fn new(
        sensor: Arc<dyn SensorLink>,
        store: Arc<dyn RecordStore>,
        broadcaster: Arc<Broadcaster>,
        timing: AcquisitionTiming,
    ) -> Self {
        let shared = Shared {
            sensor,
            store,
            broadcaster,
            timing,
            wind_speed: AtomicU64::new(0f64.to_bits()),
            recording: AtomicBool::new(true),
            running: AtomicBool::new(false),
            last_timestamp: AtomicI64::new(i64::MIN),
            counters: Counters::default(),
        };
        Self {
            shared: Arc::new(shared),
            runner: Mutex::new(None),
        }
    }

    /// Spawn the sampling, delivery and store tasks.
    ///
    /// Returns `false` if the loop was already running; a second start never spawns a
    /// second loop.
    pub async fn start(&self) -> bool {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            tracing::debug!("Acquisition loop already running");
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (deliveries, delivery_rx) = mpsc::channel(self.shared.timing.broadcast_queue.max(1));
        let (appends, append_rx) = mpsc::channel(self.shared.timing.store_queue.max(1));

        let delivery = tokio::spawn(deliver(Arc::clone(&self.shared.broadcaster), delivery_rx));
        let persistence = tokio::spawn(persist(Arc::clone(&self.shared), append_rx));
        let queues = Queues {
            deliveries,
            appends,
        };
        let sampler = tokio::spawn(sample(Arc::clone(&self.shared), queues, shutdown_rx));

        *runner = Some(Runner {
            shutdown,
            sampler,
            delivery,
            persistence,
        });
        self.shared.running.store(true, Ordering::SeqCst);
        true
    }

    /// Stop sampling, drain both queues, flush the store and disconnect the sensor.
    ///
    /// The tick in progress completes first; pending sleeps are cancelled. Every record
    /// already queued is broadcast and appended before the final flush. When this returns
    /// no further record is produced, broadcast or appended. Calling it while stopped does
    /// nothing.
    pub async fn stop(&self) {
        let mut runner = self.runner.lock().await;
        let Some(Runner {
            shutdown,
            sampler,
            delivery,
            persistence,
        }) = runner.take()
        else {
            return;
        };

        let _ = shutdown.send(true);
        if let Err(e) = sampler.await {
            tracing::error!("Acquisition task failed: {}", e);
        }
        // The sampler owned the only queue senders, so both tasks end once drained.
        if let Err(e) = delivery.await {
            tracing::error!("Delivery task failed: {}", e);
        }
        if let Err(e) = persistence.await {
            tracing::error!("Store task failed: {}", e);
        }

        if let Err(e) = self.shared.store.flush().await {
            tracing::error!(
                pending = self.shared.store.pending_len().await,
                "Final flush failed, pending records remain in memory: {}",
                e
            );
        }
        self.shared.sensor.disconnect().await;
        self.shared.running.store(false, Ordering::SeqCst);
        tracing::info!(stats = ?self.stats(), "Acquisition loop stopped");
    }

    /// Whether the loop is started
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Set the commanded wind speed stamped into subsequent records.
    pub fn set_wind_speed(&self, wind_speed: f64) -> AppResult<()> {
        if !wind_speed.is_finite() || wind_speed < 0.0 {
            return Err(DaqError::InvalidSetpoint(wind_speed));
        }
        let previous = self
            .shared
            .wind_speed
            .swap(wind_speed.to_bits(), Ordering::SeqCst);
        tracing::info!(
            from = f64::from_bits(previous),
            to = wind_speed,
            "Wind speed setpoint changed"
        );
        Ok(())
    }

    /// Current setpoint
    pub fn wind_speed(&self) -> f64 {
        self.shared.wind_speed()
    }

    /// Resume appending records to the store
    pub fn start_recording(&self) {
        if !self.shared.recording.swap(true, Ordering::SeqCst) {
            tracing::info!("Recording started");
        }
    }

    /// Keep broadcasting but stop appending records to the store
    pub fn stop_recording(&self) {
        if self.shared.recording.swap(false, Ordering::SeqCst) {
            tracing::info!("Recording stopped");
        }
    }

    /// Whether records are queued for the store
    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    /// Counter snapshot
    pub fn stats(&self) -> AcquisitionStats {
        self.shared.counters.snapshot()
    }

    /// Pipeline snapshot for status queries
    pub async fn status(&self) -> SystemStatus {
        let sensor = &self.shared.sensor;
        SystemStatus {
            sensor: sensor.name().to_string(),
            sensor_state: sensor.state(),
            sensor_connected: sensor.is_connected(),
            running: self.is_running(),
            recording: self.is_recording(),
            wind_speed: self.wind_speed(),
            subscribers: self.shared.broadcaster.active_count().await,
            pending_records: self.shared.store.pending_len().await,
            data_file: self.shared.store.location().await,
        }
    }

    /// Timing the loop was built with
    pub fn timing(&self) -> AcquisitionTiming {
        self.shared.timing
    }

    /// Store fed by the loop, for queries
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.shared.store
    }

    /// Broadcaster fed by the loop, for registering connections
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.shared.broadcaster
    }

    /// Sensor link driven by the loop
    pub fn sensor(&self) -> &Arc<dyn SensorLink> {
        &self.shared.sensor
    }
}

impl Drop for AcquisitionLoop {
    /// Signals the tasks to finish; there is no final flush or disconnect without `stop()`.
    fn drop(&mut self) {
        if let Some(runner) = self.runner.get_mut().take() {
            tracing::warn!("Acquisition loop dropped while running; call stop() to flush");
            let _ = runner.shutdown.send(true);
        }
    }
}
