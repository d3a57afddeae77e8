//! Live fan-out of records to connected subscribers.
//!
//! # Architecture
//!
//! ```text
//! AcquisitionLoop → Broadcaster → [Subscriber 1, Subscriber 2, ...]
//!                                      ↓              ↓
//!                                  WebSocket      Console / tests
//! ```
//!
//! The connection-accepting layer wraps each client in a [`Subscriber`] implementation and
//! registers it with [`Broadcaster::connect`]. Every broadcast serializes the record once and
//! sends the shared message to all members concurrently; a member whose send fails or
//! exceeds the send timeout is evicted without affecting the others.
//!
//! # Example
//!
//! ```rust,no_run
//! use tunnel_daq::measurement::Broadcaster;
//! use std::time::Duration;
//!
//! # async fn example(record: tunnel_daq::core::Record) {
//! let broadcaster = Broadcaster::new(100, Duration::from_secs(1));
//!
//! let (_gui, mut gui_rx) = broadcaster.subscribe("gui").await;
//! let (_console, mut console_rx) = broadcaster.subscribe("console").await;
//!
//! broadcaster.broadcast(&record).await;
//! assert!(gui_rx.recv().await.is_some());
//! # }
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::config::BroadcastConfig;
use crate::core::Record;

/// Process-unique identity of a registered subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A connection that can receive serialized records.
///
/// An `Err` from `send` means the connection is unusable; the broadcaster evicts it.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Deliver one JSON message
    async fn send(&self, message: Arc<str>) -> Result<()>;
}

/// Opaque per-connection reference owned by the [`Broadcaster`] while registered.
#[derive(Clone)]
pub struct SubscriberHandle {
    id: SubscriberId,
    name: Arc<str>,
    sink: Arc<dyn Subscriber>,
}

impl SubscriberHandle {
    /// Wrap a connection; the name is used only for logs
    pub fn new(name: impl Into<String>, sink: Arc<dyn Subscriber>) -> Self {
        let name: String = name.into();
        Self {
            id: SubscriberId::next(),
            name: Arc::from(name),
            sink,
        }
    }

    /// Identity used for `disconnect` and `send_to`
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Subscriber backed by a bounded mpsc channel.
///
/// Sending waits for space in the channel (bounded by the broadcaster's send timeout);
/// a dropped receiver makes every send fail.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSubscriber {
    /// Create the subscriber and the receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn send(&self, message: Arc<str>) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow!("subscriber channel closed"))
    }
}

/// Outcome of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members that accepted the message
    pub delivered: usize,
    /// Members removed because their send failed or timed out
    pub evicted: Vec<SubscriberId>,
}

/// Fan-out broadcaster with per-subscriber failure isolation.
///
/// Membership is guarded by its own lock. Delivery works on a snapshot taken under that
/// lock and released before any send, so registrations never wait on an in-flight
/// broadcast and are not seen by it.
pub struct Broadcaster {
    members: Mutex<HashMap<SubscriberId, SubscriberHandle>>,
    channel_capacity: usize,
    send_timeout: Duration,
}

impl Broadcaster {
    /// Creates a broadcaster.
    ///
    /// # Arguments
    ///
    /// * `channel_capacity` - Buffer size for subscribers created by [`subscribe`](Self::subscribe)
    /// * `send_timeout` - Longest a single member may take to accept a message
    pub fn new(channel_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            channel_capacity,
            send_timeout,
        }
    }

    /// Creates a broadcaster from the `[broadcast]` settings section.
    pub fn with_settings(settings: &BroadcastConfig) -> Self {
        Self::new(settings.channel_capacity, settings.send_timeout)
    }

    /// Register a handle; it receives every broadcast that starts after this returns.
    ///
    /// Registering the same handle twice keeps a single membership.
    pub async fn connect(&self, handle: SubscriberHandle) {
        let mut members = self.members.lock().await;
        let id = handle.id();
        let name = handle.name.clone();
        members.insert(id, handle);
        tracing::info!(
            subscriber = %name,
            id = %id,
            active = members.len(),
            "Subscriber connected"
        );
    }

    /// Create a channel-backed subscriber, register it and return its receiving end.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
    ) -> (SubscriberHandle, mpsc::Receiver<Arc<str>>) {
        let (sink, rx) = ChannelSubscriber::channel(self.channel_capacity);
        let handle = SubscriberHandle::new(name, Arc::new(sink));
        self.connect(handle.clone()).await;
        (handle, rx)
    }

    /// Remove a member; returns whether it was registered.
    pub async fn disconnect(&self, id: SubscriberId) -> bool {
        let mut members = self.members.lock().await;
        match members.remove(&id) {
            Some(handle) => {
                tracing::info!(
                    subscriber = %handle.name,
                    id = %id,
                    active = members.len(),
                    "Subscriber disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Serialize a record once and deliver it to every current member.
    pub async fn broadcast(&self, record: &Record) -> BroadcastReport {
        if self.active_count().await == 0 {
            return BroadcastReport::default();
        }

        match record.to_message() {
            Ok(message) => self.broadcast_message(message).await,
            Err(e) => {
                tracing::error!("Failed to serialize record for broadcast: {}", e);
                BroadcastReport::default()
            }
        }
    }

    /// Deliver a pre-serialized message to every current member.
    pub async fn broadcast_message(&self, message: Arc<str>) -> BroadcastReport {
        let snapshot: Vec<SubscriberHandle> = {
            let members = self.members.lock().await;
            members.values().cloned().collect()
        };
        if snapshot.is_empty() {
            return BroadcastReport::default();
        }

        let sends = snapshot.iter().map(|handle| {
            let message = Arc::clone(&message);
            async move { self.deliver(handle, message).await }
        });
        let results = join_all(sends).await;

        let mut report = BroadcastReport::default();
        for (handle, ok) in snapshot.iter().zip(results) {
            if ok {
                report.delivered += 1;
            } else {
                report.evicted.push(handle.id());
            }
        }

        if !report.evicted.is_empty() {
            self.evict(&report.evicted).await;
        }
        report
    }

    /// Send one message to a single member, evicting it on failure.
    ///
    /// Returns `false` if the member is unknown or the send failed.
    pub async fn send_to(&self, id: SubscriberId, message: Arc<str>) -> bool {
        let handle = {
            let members = self.members.lock().await;
            members.get(&id).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };

        let ok = self.deliver(&handle, message).await;
        if !ok {
            self.evict(&[id]).await;
        }
        ok
    }

    /// Number of registered members
    pub async fn active_count(&self) -> usize {
        self.members.lock().await.len()
    }

    async fn deliver(&self, handle: &SubscriberHandle, message: Arc<str>) -> bool {
        match tokio::time::timeout(self.send_timeout, handle.sink.send(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(
                    subscriber = %handle.name,
                    id = %handle.id,
                    "Failed to send to subscriber: {}",
                    e
                );
                false
            }
            Err(_) => {
                tracing::warn!(
                    subscriber = %handle.name,
                    id = %handle.id,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Subscriber send timed out"
                );
                false
            }
        }
    }

    async fn evict(&self, ids: &[SubscriberId]) {
        let mut members = self.members.lock().await;
        for id in ids {
            members.remove(id);
        }
        tracing::info!(
            evicted = ids.len(),
            active = members.len(),
            "Evicted failed subscribers"
        );
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::with_settings(&BroadcastConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RawReading;
    use chrono::Utc;
    use tracing_test::traced_test;

    struct FailingSubscriber;

    struct StalledSubscriber;

    #[async_trait]
    impl Subscriber for StalledSubscriber {
        async fn send(&self, _message: Arc<str>) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[async_trait]
    impl Subscriber for FailingSubscriber {
        async fn send(&self, _message: Arc<str>) -> Result<()> {
            Err(anyhow!("socket reset"))
        }
    }

    fn record() -> Record {
        Record::new(Utc::now(), 3.0, RawReading::new(1000.0, 5.0))
    }

    #[tokio::test]
    async fn test_broadcast_without_members_is_noop() {
        let broadcaster = Broadcaster::default();
        let report = broadcaster.broadcast(&record()).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_subscribers_receive_serialized_record() {
        let broadcaster = Broadcaster::default();
        let (_a, mut rx_a) = broadcaster.subscribe("a").await;
        let (_b, mut rx_b) = broadcaster.subscribe("b").await;

        let sent = record();
        let report = broadcaster.broadcast(&sent).await;
        assert_eq!(report.delivered, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let message = rx.recv().await.unwrap();
            let received: Record = serde_json::from_str(&message).unwrap();
            assert_eq!(received, sent);
        }
    }

    #[tokio::test]
    async fn test_failed_member_is_evicted() {
        let broadcaster = Broadcaster::default();
        let failing = SubscriberHandle::new("flaky", Arc::new(FailingSubscriber));
        let failing_id = failing.id();
        broadcaster.connect(failing).await;
        let (_ok, mut rx) = broadcaster.subscribe("ok").await;
        assert_eq!(broadcaster.active_count().await, 2);

        let report = broadcaster.broadcast(&record()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![failing_id]);
        assert_eq!(broadcaster.active_count().await, 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_connect_is_unique_and_disconnect_is_noop_when_absent() {
        let broadcaster = Broadcaster::default();
        let (handle, _rx) = broadcaster.subscribe("gui").await;
        broadcaster.connect(handle.clone()).await;
        assert_eq!(broadcaster.active_count().await, 1);

        assert!(broadcaster.disconnect(handle.id()).await);
        assert!(!broadcaster.disconnect(handle.id()).await);
        assert_eq!(broadcaster.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_to_single_member() {
        let broadcaster = Broadcaster::default();
        let (a, mut rx_a) = broadcaster.subscribe("a").await;
        let (_b, mut rx_b) = broadcaster.subscribe("b").await;

        assert!(broadcaster.send_to(a.id(), Arc::from("{\"hello\":1}")).await);
        assert_eq!(&*rx_a.recv().await.unwrap(), "{\"hello\":1}");
        assert!(rx_b.try_recv().is_err());

        drop(rx_a);
        assert!(!broadcaster.send_to(a.id(), Arc::from("{}")).await);
        assert_eq!(broadcaster.active_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_member_times_out_without_blocking_others() {
        let broadcaster = Broadcaster::new(8, Duration::from_secs(1));
        let stalled = SubscriberHandle::new("stalled", Arc::new(StalledSubscriber));
        broadcaster.connect(stalled).await;
        let (_ok, mut rx) = broadcaster.subscribe("ok").await;

        let started = tokio::time::Instant::now();
        let report = broadcaster.broadcast(&record()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(broadcaster.active_count().await, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_eviction_is_logged() {
        let broadcaster = Broadcaster::default();
        broadcaster
            .connect(SubscriberHandle::new("flaky", Arc::new(FailingSubscriber)))
            .await;
        broadcaster.broadcast(&record()).await;

        assert!(logs_contain("Failed to send to subscriber"));
        assert!(logs_contain("socket reset"));
    }
}
