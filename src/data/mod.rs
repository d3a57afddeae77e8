//! Persistence of acquired records.
//!
//! - [`storage`]: the [`RecordStore`] port and [`BufferedStore`], which batches appends in
//!   memory and rewrites the backing medium once per `flush_threshold` records
//! - [`medium`]: where the persisted log lives ([`JsonFileMedium`] on disk,
//!   [`MemoryMedium`] for tests)

pub mod medium;
pub mod storage;

pub use medium::{read_log, JsonFileMedium, MemoryMedium, StorageMedium};
pub use storage::{BufferedStore, RecordStore};

/// Pending records that trigger a flush when no threshold is configured
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10;
