//! Integration tests for the acquisition loop.
//!
//! All tests run on a paused clock: the loop, the mock sensor and the broadcaster only
//! wait through `tokio::time`, so the runtime advances virtual time whenever every task
//! is idle. Checkpoints sit between tick deadlines (ticks at 0, 100, 200, ... ms).

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tunnel_daq::acquisition::{AcquisitionLoop, AcquisitionTiming};
use tunnel_daq::core::Record;
use tunnel_daq::data::{BufferedStore, MemoryMedium, RecordStore, StorageMedium};
use tunnel_daq::error::AppResult;
use tunnel_daq::hardware::{mock::MockTunnelSensor, ConnectionState, SensorLink};
use tunnel_daq::measurement::{Broadcaster, Subscriber, SubscriberHandle};

struct Harness {
    sensor: Arc<MockTunnelSensor>,
    medium: MemoryMedium,
    store: Arc<BufferedStore<MemoryMedium>>,
    broadcaster: Arc<Broadcaster>,
    daq: AcquisitionLoop,
}

fn timing() -> AcquisitionTiming {
    AcquisitionTiming {
        sampling_interval: Duration::from_millis(100),
        read_timeout: Duration::from_secs(1),
        retry_interval: Duration::from_secs(5),
        broadcast_queue: 16,
        store_queue: 64,
    }
}

fn harness_with(flush_threshold: usize, timing: AcquisitionTiming) -> Harness {
    let sensor = Arc::new(MockTunnelSensor::new().with_connect_delay(Duration::ZERO));
    let medium = MemoryMedium::new();
    let store = Arc::new(BufferedStore::new(medium.clone(), flush_threshold));
    let broadcaster = Arc::new(Broadcaster::new(64, Duration::from_secs(1)));
    let daq = AcquisitionLoop::new(
        sensor.clone(),
        store.clone(),
        broadcaster.clone(),
        timing,
    );
    Harness {
        sensor,
        medium,
        store,
        broadcaster,
        daq,
    }
}

fn harness() -> Harness {
    harness_with(10, timing())
}

fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Record> {
    let mut records = Vec::new();
    while let Ok(message) = rx.try_recv() {
        records.push(serde_json::from_str(&message).expect("broadcast is a record"));
    }
    records
}

#[tokio::test(start_paused = true)]
async fn test_records_reach_store_and_subscribers() {
    let h = harness();
    let (_handle, mut rx) = h.broadcaster.subscribe("test").await;

    assert!(h.daq.start().await);
    sleep(Duration::from_millis(350)).await;

    let stats = h.daq.stats();
    assert_eq!(stats.records, 4);
    assert_eq!(h.store.get_all().await.unwrap().len(), 4);

    let delivered = drain(&mut rx);
    assert_eq!(delivered, h.store.get_all().await.unwrap());

    h.daq.stop().await;
    assert_eq!(h.store.pending_len().await, 0);
    assert_eq!(h.medium.persisted().await.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_empty_read_skips_tick_at_sampling_interval() {
    let h = harness();
    let (_handle, mut rx) = h.broadcaster.subscribe("test").await;
    h.sensor.return_empty_reads(2);

    h.daq.start().await;
    sleep(Duration::from_millis(350)).await;

    // ticks at 0 and 100 read nothing, 200 and 300 produce records
    let stats = h.daq.stats();
    assert_eq!(h.sensor.read_count(), 4);
    assert_eq!(stats.empty_reads, 2);
    assert_eq!(stats.records, 2);
    assert_eq!(stats.connection_losses, 0);
    assert_eq!(h.store.get_all().await.unwrap().len(), 2);
    assert_eq!(drain(&mut rx).len(), 2);

    h.daq.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_waits_retry_interval_before_reconnect() {
    let h = harness();
    h.daq.start().await;

    sleep(Duration::from_millis(250)).await;
    assert_eq!(h.daq.stats().records, 3);
    assert_eq!(h.sensor.connect_attempts(), 1);

    // the tick at 300ms loses the link
    h.sensor.drop_connection();
    sleep(Duration::from_millis(350)).await;
    let stats = h.daq.stats();
    assert_eq!(stats.connection_losses, 1);
    assert_eq!(stats.records, 3);
    assert_eq!(h.sensor.state(), ConnectionState::Disconnected);

    // nothing happens during the gap
    sleep(Duration::from_millis(4_650)).await; // t = 5250ms
    assert_eq!(h.sensor.connect_attempts(), 1);
    assert_eq!(h.daq.stats().records, 3);

    // the reconnect attempt comes 5s after the loss and readings resume
    sleep(Duration::from_millis(100)).await; // t = 5350ms
    assert_eq!(h.sensor.connect_attempts(), 2);
    assert!(h.sensor.is_connected());
    assert_eq!(h.daq.stats().records, 4);

    h.daq.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_connects_are_retried_at_retry_interval() {
    let h = harness();
    h.sensor.fail_next_connects(2);
    h.daq.start().await;

    sleep(Duration::from_millis(4_900)).await;
    assert_eq!(h.sensor.connect_attempts(), 1);
    assert_eq!(h.daq.stats().records, 0);

    sleep(Duration::from_millis(5_000)).await; // t = 9900ms
    assert_eq!(h.sensor.connect_attempts(), 2);
    assert_eq!(h.daq.stats().records, 0);

    sleep(Duration::from_millis(150)).await; // t = 10050ms
    let stats = h.daq.stats();
    assert_eq!(h.sensor.connect_attempts(), 3);
    assert_eq!(stats.connect_failures, 2);
    assert_eq!(stats.records, 1);

    h.daq.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_double_start_runs_a_single_loop() {
    let h = harness();
    assert!(h.daq.start().await);
    assert!(!h.daq.start().await);
    assert!(h.daq.is_running());

    sleep(Duration::from_millis(350)).await;
    assert_eq!(h.sensor.read_count(), 4);
    assert_eq!(h.daq.stats().ticks, 4);

    h.daq.stop().await;
    h.daq.stop().await;
    assert!(!h.daq.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_nothing_happens_after_stop() {
    let h = harness();
    let (_handle, mut rx) = h.broadcaster.subscribe("test").await;
    h.daq.start().await;
    sleep(Duration::from_millis(250)).await;

    h.daq.stop().await;
    let stats = h.daq.stats();
    let reads = h.sensor.read_count();
    let delivered = drain(&mut rx).len() as u64;
    assert_eq!(delivered, stats.records);
    assert_eq!(h.sensor.state(), ConnectionState::Disconnected);
    assert_eq!(h.medium.persisted().await.len() as u64, stats.records);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.daq.stats(), stats);
    assert_eq!(h.sensor.read_count(), reads);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop() {
    let h = harness();
    h.daq.start().await;
    sleep(Duration::from_millis(150)).await;
    h.daq.stop().await;
    let first_run = h.daq.stats().records;

    assert!(h.daq.start().await);
    sleep(Duration::from_millis(150)).await;
    h.daq.stop().await;

    assert!(h.daq.stats().records > first_run);
    assert_eq!(h.sensor.connect_attempts(), 2);
    assert_eq!(
        h.medium.persisted().await.len() as u64,
        h.daq.stats().records
    );
}

#[tokio::test(start_paused = true)]
async fn test_recording_off_still_broadcasts() {
    let h = harness();
    let (_handle, mut rx) = h.broadcaster.subscribe("test").await;
    h.daq.stop_recording();

    h.daq.start().await;
    sleep(Duration::from_millis(250)).await;
    h.daq.stop().await;

    assert_eq!(drain(&mut rx).len(), 3);
    assert!(h.store.get_all().await.unwrap().is_empty());
    assert_eq!(h.medium.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_does_not_stop_the_loop() {
    let h = harness_with(2, timing());
    h.medium.fail_writes(true);

    h.daq.start().await;
    sleep(Duration::from_millis(350)).await;

    let stats = h.daq.stats();
    assert_eq!(stats.records, 4);
    assert!(stats.store_failures > 0);
    assert_eq!(h.store.pending_len().await, 4);
    assert!(h.medium.persisted().await.is_empty());

    // the retained buffer is written by the next successful flush
    h.medium.fail_writes(false);
    h.daq.stop().await;
    let persisted = h.medium.persisted().await;
    assert_eq!(persisted.len() as u64, h.daq.stats().records);
    assert_eq!(h.store.pending_len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_records_carry_setpoint_and_ordered_timestamps() {
    let h = harness();
    h.daq.set_wind_speed(12.5).unwrap();
    h.daq.start().await;
    sleep(Duration::from_millis(250)).await;
    h.daq.set_wind_speed(15.0).unwrap();
    sleep(Duration::from_millis(200)).await;
    h.daq.stop().await;

    let records = h.store.get_all().await.unwrap();
    assert_eq!(records.len(), 5);
    assert!(records[..3].iter().all(|r| r.wind_speed == 12.5));
    assert!(records[3..].iter().all(|r| r.wind_speed == 15.0));
    assert!(records
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
}

struct SlowSubscriber;

#[async_trait]
impl Subscriber for SlowSubscriber {
    async fn send(&self, _message: Arc<str>) -> Result<()> {
        sleep(Duration::from_secs(10)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_never_delays_sampling() {
    let mut slow_timing = timing();
    slow_timing.broadcast_queue = 1;
    let sensor = Arc::new(MockTunnelSensor::new().with_connect_delay(Duration::ZERO));
    let store = Arc::new(BufferedStore::new(MemoryMedium::new(), 10));
    let broadcaster = Arc::new(Broadcaster::new(8, Duration::from_secs(60)));
    broadcaster
        .connect(SubscriberHandle::new("slow", Arc::new(SlowSubscriber)))
        .await;
    let daq = AcquisitionLoop::new(sensor.clone(), store.clone(), broadcaster, slow_timing);

    daq.start().await;
    sleep(Duration::from_millis(550)).await;

    let stats = daq.stats();
    assert_eq!(stats.records, 6);
    assert!(stats.dropped_broadcasts > 0);
    assert_eq!(store.get_all().await.unwrap().len(), 6);

    daq.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_reflects_pipeline() {
    let h = harness();
    let (_handle, _rx) = h.broadcaster.subscribe("status").await;
    h.daq.set_wind_speed(8.0).unwrap();
    h.daq.start().await;
    sleep(Duration::from_millis(250)).await;

    let status = h.daq.status().await;
    assert!(status.running);
    assert!(status.recording);
    assert!(status.sensor_connected);
    assert_eq!(status.sensor_state, ConnectionState::Connected);
    assert_eq!(status.wind_speed, 8.0);
    assert_eq!(status.subscribers, 1);
    assert_eq!(status.pending_records, 3);
    assert_eq!(status.data_file, h.store.location().await);

    h.daq.stop().await;
    let status = h.daq.status().await;
    assert!(!status.running);
    assert!(!status.sensor_connected);
    assert_eq!(status.pending_records, 0);
}

/// Memory medium whose writes take 400ms
struct SlowMedium(MemoryMedium);

#[async_trait]
impl StorageMedium for SlowMedium {
    async fn load(&self) -> AppResult<Vec<Record>> {
        self.0.load().await
    }

    async fn replace(&self, records: &[Record]) -> AppResult<()> {
        sleep(Duration::from_millis(400)).await;
        self.0.replace(records).await
    }

    async fn rotate(&mut self) -> AppResult<PathBuf> {
        self.0.rotate().await
    }

    fn location(&self) -> PathBuf {
        self.0.location()
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_never_delays_sampling() {
    let sensor = Arc::new(MockTunnelSensor::new().with_connect_delay(Duration::ZERO));
    let medium = MemoryMedium::new();
    // every append flushes, and every flush takes four sampling intervals
    let store = Arc::new(BufferedStore::new(SlowMedium(medium.clone()), 1));
    let daq = AcquisitionLoop::new(
        sensor.clone(),
        store,
        Arc::new(Broadcaster::default()),
        timing(),
    );

    daq.start().await;
    sleep(Duration::from_millis(1_050)).await;

    let stats = daq.stats();
    assert_eq!(stats.ticks, 11);
    assert_eq!(stats.records, 11);
    assert_eq!(sensor.read_count(), 11);
    assert!(medium.persisted().await.len() < 11);

    // stop waits for the queued appends
    daq.stop().await;
    assert_eq!(medium.persisted().await.len(), 11);
    assert_eq!(daq.stats().store_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_connect_finishes_the_tick() {
    // default connect delay is 100ms, so stop arrives mid-connect
    let sensor = Arc::new(MockTunnelSensor::new());
    let medium = MemoryMedium::new();
    let store = Arc::new(BufferedStore::new(medium.clone(), 10));
    let broadcaster = Arc::new(Broadcaster::new(64, Duration::from_secs(1)));
    let (_handle, mut rx) = broadcaster.subscribe("test").await;
    let daq = AcquisitionLoop::new(sensor.clone(), store, broadcaster, timing());

    daq.start().await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(sensor.connect_attempts(), 1);
    assert!(!sensor.is_connected());

    daq.stop().await;
    let stats = daq.stats();
    assert_eq!(stats.records, 1);
    assert_eq!(medium.persisted().await.len(), 1);
    assert_eq!(drain(&mut rx).len(), 1);
    assert_eq!(sensor.state(), ConnectionState::Disconnected);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(daq.stats(), stats);
    assert_eq!(sensor.read_count(), 1);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_a_running_loop_ends_sampling() {
    let h = harness();
    h.daq.start().await;
    sleep(Duration::from_millis(250)).await;

    let Harness { sensor, daq, .. } = h;
    drop(daq);
    sleep(Duration::from_millis(100)).await;
    let reads = sensor.read_count();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(sensor.read_count(), reads);
}
