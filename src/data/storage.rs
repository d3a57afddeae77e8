//! Buffered record storage.
//!
//! [`BufferedStore`] keeps accepted records in a pending buffer and, once the buffer holds
//! `flush_threshold` records, rewrites the whole backing medium with
//! `persisted ++ pending`. The buffer is cleared only after the rewrite succeeded, so a
//! failed flush is retried by the next trigger (threshold, explicit `flush`, session
//! rotation or shutdown). Reads return the same merged view, so unflushed records are
//! visible immediately.
//!
//! The pending buffer lives only in memory: records accepted since the last successful
//! flush are lost if the process dies.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::medium::{JsonFileMedium, StorageMedium};
use crate::config::StorageConfig;
use crate::core::Record;
use crate::error::AppResult;

/// Store port consumed by the acquisition loop and the query layer.
///
/// An `Err` is the failure signal of each operation; none of them panic.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Accept a record; flushes first if the buffer reaches the threshold.
    ///
    /// On a failed flush the record stays buffered and the error is returned.
    async fn append(&self, record: Record) -> AppResult<()>;

    /// Write all pending records regardless of the threshold
    async fn flush(&self) -> AppResult<()>;

    /// Persisted log followed by the still-pending records, in order
    async fn get_all(&self) -> AppResult<Vec<Record>>;

    /// The last `count` records of [`get_all`](Self::get_all)
    async fn get_recent(&self, count: usize) -> AppResult<Vec<Record>> {
        let mut all = self.get_all().await?;
        let skip = all.len().saturating_sub(count);
        Ok(all.split_off(skip))
    }

    /// Drop pending records and rewrite the medium as an empty collection
    async fn clear(&self) -> AppResult<()>;

    /// Flush into the current target, then continue in a new one
    async fn new_session(&self) -> AppResult<PathBuf>;

    /// Records accepted but not yet flushed
    async fn pending_len(&self) -> usize;

    /// Current target (file path or medium identifier)
    async fn location(&self) -> PathBuf;
}

struct Inner<M> {
    medium: M,
    pending: Vec<Record>,
}

impl<M: StorageMedium> Inner<M> {
    async fn flush(&mut self) -> AppResult<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let mut records = self.medium.load().await?;
        records.extend_from_slice(&self.pending);
        self.medium.replace(&records).await?;

        let flushed = self.pending.len();
        self.pending.clear();
        tracing::debug!(
            flushed,
            total = records.len(),
            target = %self.medium.location().display(),
            "Flushed pending records"
        );
        Ok(flushed)
    }
}

/// Write-batching store over a [`StorageMedium`].
///
/// One lock guards the pending buffer and the medium, shared by every operation, so
/// appends, flushes and reads never interleave.
pub struct BufferedStore<M> {
    inner: Mutex<Inner<M>>,
    flush_threshold: usize,
}

impl<M: StorageMedium> BufferedStore<M> {
    /// Store over `medium`, flushing every `flush_threshold` records (minimum 1)
    pub fn new(medium: M, flush_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                medium,
                pending: Vec::new(),
            }),
            flush_threshold: flush_threshold.max(1),
        }
    }

    /// Configured flush threshold
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }
}

impl BufferedStore<JsonFileMedium> {
    /// JSON file store at `path`
    pub fn json_file(path: impl Into<PathBuf>, flush_threshold: usize) -> Self {
        Self::new(JsonFileMedium::new(path), flush_threshold)
    }

    /// JSON file store from the `[storage]` settings section
    pub fn with_settings(settings: &StorageConfig) -> Self {
        Self::json_file(settings.readings_path(), settings.flush_threshold)
    }
}

#[async_trait]
impl<M: StorageMedium> RecordStore for BufferedStore<M> {
    async fn append(&self, record: Record) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.pending.push(record);

        if inner.pending.len() >= self.flush_threshold {
            if let Err(e) = inner.flush().await {
                tracing::error!(
                    pending = inner.pending.len(),
                    target = %inner.medium.location().display(),
                    "Error flushing buffer: {}",
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.flush().await.map(|_| ()).map_err(|e| {
            tracing::error!(
                pending = inner.pending.len(),
                "Error flushing buffer: {}",
                e
            );
            e
        })
    }

    async fn get_all(&self) -> AppResult<Vec<Record>> {
        let inner = self.inner.lock().await;
        let mut records = inner.medium.load().await?;
        records.extend_from_slice(&inner.pending);
        Ok(records)
    }

    async fn clear(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.pending.clear();
        inner.medium.replace(&[]).await?;
        tracing::info!(target = %inner.medium.location().display(), "Cleared all readings");
        Ok(())
    }

    async fn new_session(&self) -> AppResult<PathBuf> {
        let mut inner = self.inner.lock().await;
        inner.flush().await?;
        let previous = inner.medium.location();
        let next = inner.medium.rotate().await?;
        tracing::info!(
            previous = %previous.display(),
            next = %next.display(),
            "Started new session"
        );
        Ok(next)
    }

    async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    async fn location(&self) -> PathBuf {
        self.inner.lock().await.medium.location()
    }
}
