//! Backing media for the persisted record log.
//!
//! A medium stores the whole log as one collection and only supports whole-collection
//! replacement; batching is the job of [`BufferedStore`](super::BufferedStore).

use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::Record;
use crate::error::{AppResult, DaqError};

/// Where the persisted log lives.
#[async_trait]
pub trait StorageMedium: Send + Sync {
    /// Read the full persisted log of the current target
    async fn load(&self) -> AppResult<Vec<Record>>;

    /// Atomically replace the current target with `records`
    async fn replace(&self, records: &[Record]) -> AppResult<()>;

    /// Switch to a new, empty target; the previous one is left untouched
    async fn rotate(&mut self) -> AppResult<PathBuf>;

    /// Identifier of the current target
    fn location(&self) -> PathBuf;
}

// =============================================================================
// JSON file
// =============================================================================

/// Read a JSON record log without creating or modifying anything.
///
/// A missing file is an `Io` error; an empty file is an empty log.
pub async fn read_log(path: &Path) -> AppResult<Vec<Record>> {
    let content = tokio::fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).map_err(|e| {
        DaqError::Storage(format!("Corrupt record log '{}': {}", path.display(), e))
    })
}

/// Pretty-printed JSON array on disk, replaced through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct JsonFileMedium {
    path: PathBuf,
}

impl JsonFileMedium {
    /// Use `path` as the log file; it is created with `[]` on first access
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn ensure_exists(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if !tokio::fs::try_exists(&self.path).await? {
            tokio::fs::write(&self.path, b"[]").await?;
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn session_path(dir: &Path) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut candidate = dir.join(format!("session_{stamp}.json"));
        let mut suffix = 1;
        while candidate.exists() {
            candidate = dir.join(format!("session_{stamp}_{suffix}.json"));
            suffix += 1;
        }
        candidate
    }
}

#[async_trait]
impl StorageMedium for JsonFileMedium {
    async fn load(&self) -> AppResult<Vec<Record>> {
        self.ensure_exists().await?;
        read_log(&self.path).await
    }

    async fn replace(&self, records: &[Record]) -> AppResult<()> {
        let body = serde_json::to_vec_pretty(records)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, body).await?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn rotate(&mut self) -> AppResult<PathBuf> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let next = Self::session_path(&dir);
        let rotated = Self::new(next.clone());
        rotated.ensure_exists().await?;
        *self = rotated;
        Ok(next)
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
struct MemoryShared {
    sessions: Mutex<Vec<Vec<Record>>>,
    current: AtomicUsize,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

/// In-memory log for tests; clones share the same state so a test can keep one to
/// inspect what was persisted while the store owns another.
#[derive(Clone)]
pub struct MemoryMedium {
    shared: Arc<MemoryShared>,
}

impl MemoryMedium {
    /// Empty log with a single session
    pub fn new() -> Self {
        let shared = MemoryShared {
            sessions: Mutex::new(vec![Vec::new()]),
            ..Default::default()
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Make every `replace` fail until switched off again
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful `replace` calls so far
    pub fn write_count(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Persisted content of the current session
    pub async fn persisted(&self) -> Vec<Record> {
        let index = self.shared.current.load(Ordering::SeqCst);
        self.shared.sessions.lock().await[index].clone()
    }

    /// Persisted content of every session, oldest first
    pub async fn sessions(&self) -> Vec<Vec<Record>> {
        self.shared.sessions.lock().await.clone()
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageMedium for MemoryMedium {
    async fn load(&self) -> AppResult<Vec<Record>> {
        Ok(self.persisted().await)
    }

    async fn replace(&self, records: &[Record]) -> AppResult<()> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(DaqError::Storage("simulated write failure".to_string()));
        }
        let index = self.shared.current.load(Ordering::SeqCst);
        self.shared.sessions.lock().await[index] = records.to_vec();
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rotate(&mut self) -> AppResult<PathBuf> {
        let mut sessions = self.shared.sessions.lock().await;
        sessions.push(Vec::new());
        self.shared.current.store(sessions.len() - 1, Ordering::SeqCst);
        Ok(self.location())
    }

    fn location(&self) -> PathBuf {
        PathBuf::from(format!(
            "memory://session-{}",
            self.shared.current.load(Ordering::SeqCst)
        ))
    }
}
