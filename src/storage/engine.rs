//! Record store trait

use crate::error::Result;
use crate::record::{NewRecord, Record, RecordFilter, RecordId, RecordPatch, RecordStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-status record counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

impl StatusCounts {
    pub fn get(&self, status: &RecordStatus) -> u64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }

    pub fn unused(&self) -> u64 {
        self.get(&RecordStatus::Unused)
    }

    pub(crate) fn add(&mut self, status: &RecordStatus) {
        self.total += 1;
        *self.by_status.entry(status.as_str().to_string()).or_insert(0) += 1;
    }
}

/// Store tuning shared by all implementations
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Name filters in `find` ignore case
    pub case_insensitive_search: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            case_insensitive_search: true,
        }
    }
}

/// Record store trait
///
/// Implementations own all record state. Every operation is atomic per
/// record; `try_claim_batch` is the only multi-record operation and is
/// built from per-record conditional transitions.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record, assigning its id and defaults
    async fn insert(&self, record: NewRecord) -> Result<Record>;

    async fn get(&self, id: RecordId) -> Result<Record>;

    /// Merge the given fields into an existing record
    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<Record>;

    async fn delete(&self, id: RecordId) -> Result<()>;

    /// Insertion-ordered scan filtered by name substring and status
    async fn find(&self, filter: &RecordFilter) -> Result<Vec<Record>>;

    /// Atomically move up to `max_count` unused records to `used` and
    /// return exactly those records.
    ///
    /// A record is either in the result and now `used`, or not in the
    /// result and untouched by this call. Concurrent calls never return the
    /// same record. Returning fewer than `max_count` (or none) is success.
    async fn try_claim_batch(&self, max_count: usize) -> Result<Vec<Record>>;

    /// Count records per status
    async fn status_counts(&self) -> Result<StatusCounts>;

    /// Flush and release resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Main storage interface
pub struct Storage {
    engine: Box<dyn RecordStore>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish()
    }
}

impl Storage {
    pub fn new(engine: Box<dyn RecordStore>) -> Self {
        Self { engine }
    }

    pub async fn insert(&self, record: NewRecord) -> Result<Record> {
        self.engine.insert(record).await
    }

    pub async fn get(&self, id: RecordId) -> Result<Record> {
        self.engine.get(id).await
    }

    pub async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<Record> {
        self.engine.update(id, patch).await
    }

    pub async fn delete(&self, id: RecordId) -> Result<()> {
        self.engine.delete(id).await
    }

    pub async fn find(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        self.engine.find(filter).await
    }

    pub async fn try_claim_batch(&self, max_count: usize) -> Result<Vec<Record>> {
        self.engine.try_claim_batch(max_count).await
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        self.engine.status_counts().await
    }

    pub async fn close(&self) -> Result<()> {
        self.engine.close().await
    }
}
