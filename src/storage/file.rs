//! Durable record store
//!
//! Combines the in-memory index with the append-only journal. Mutations
//! are applied in memory first (that is where the per-record conditional
//! update happens) and then journaled. A mutation whose journal write
//! fails is undone in memory before the error is returned, so callers
//! never see a claim that is not on disk.
//!
//! Only one `FileStore` may have a data directory open at a time; the
//! journal holds an exclusive lock on it.

use super::journal::{Journal, JournalEntry};
use super::memory::{MemoryStore, Slot};
use crate::error::Result;
use crate::record::{NewRecord, Record, RecordFilter, RecordId, RecordPatch};
use crate::storage::engine::{RecordStore, StatusCounts, StoreOptions};
use async_trait::async_trait;
use std::path::Path;
use tracing::{error, info, instrument, warn};

/// File-backed record store
pub struct FileStore {
    memory: MemoryStore,
    journal: Journal,
}

impl FileStore {
    /// Open the store in `data_dir`, replaying its journal
    pub fn open<P: AsRef<Path>>(data_dir: P, options: StoreOptions, sync_writes: bool) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let (journal, recovered) = Journal::open(data_dir, sync_writes)?;

        let memory = MemoryStore::with_options(options);
        for slot in recovered.slots {
            memory.load_slot(slot);
        }

        info!(path = ?data_dir, records = memory.len(), "File store opened");
        Ok(Self { memory, journal })
    }

    /// Open with default options and synchronous writes
    pub fn with_defaults<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        Self::open(data_dir, StoreOptions::default(), true)
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Rewrite the journal so it only holds live records
    pub fn compact(&self) -> Result<usize> {
        self.journal.compact(|| self.memory.snapshot())
    }

    /// Return the records of an unjournaled claim to the pool.
    ///
    /// Records edited since the claim keep those edits; their release is
    /// journaled on a best-effort basis since the edit may already be on
    /// disk with status `used`.
    fn rollback_claim(&self, claimed: Vec<Slot>) {
        let mut edited = Vec::new();
        for slot in claimed {
            let id = slot.record.id;
            match self.memory.release_claim(&id, slot.claim) {
                Some(released) if released.version != slot.version + 1 => {
                    edited.push(JournalEntry::Put { slot: released });
                }
                Some(_) => {}
                None => warn!(record = %id, "Claimed record changed hands before rollback"),
            }
        }

        if !edited.is_empty() {
            if let Err(e) = self.journal.append(edited) {
                warn!(error = %e, "Could not journal released records");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn journal(&self) -> &Journal {
        &self.journal
    }
}

#[async_trait]
impl RecordStore for FileStore {
    #[instrument(skip(self, record))]
    async fn insert(&self, record: NewRecord) -> Result<Record> {
        let record = Record::create(record)?;
        let slot = self.memory.insert_slot(record);

        if let Err(e) = self.journal.append(vec![JournalEntry::Put { slot: slot.clone() }]) {
            error!(error = %e, record = %slot.record.id, "Insert not journaled, rolling back");
            self.memory.revert_insert(slot.record.id, slot.version);
            return Err(e);
        }
        Ok(slot.record)
    }

    async fn get(&self, id: RecordId) -> Result<Record> {
        self.memory.get(id).await
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<Record> {
        let (previous, current) = self.memory.update_slot(id, &patch)?;

        if let Err(e) = self.journal.append(vec![JournalEntry::Put { slot: current.clone() }]) {
            error!(error = %e, record = %id, "Update not journaled, rolling back");
            self.memory.revert(previous, current.version);
            return Err(e);
        }
        Ok(current.record)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: RecordId) -> Result<()> {
        let removed = self.memory.remove_slot(id)?;
        let entry = JournalEntry::Remove {
            id,
            version: removed.version + 1,
        };

        if let Err(e) = self.journal.append(vec![entry]) {
            error!(error = %e, record = %id, "Delete not journaled, rolling back");
            self.memory.revert_delete(removed);
            return Err(e);
        }
        Ok(())
    }

    async fn find(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        self.memory.find(filter).await
    }

    #[instrument(skip(self))]
    async fn try_claim_batch(&self, max_count: usize) -> Result<Vec<Record>> {
        let claimed = self.memory.claim_slots(max_count);
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let entries = claimed
            .iter()
            .map(|slot| JournalEntry::Put { slot: slot.clone() })
            .collect();

        if let Err(e) = self.journal.append(entries) {
            error!(
                error = %e,
                records = claimed.len(),
                "Claim not journaled, returning records to the pool"
            );
            self.rollback_claim(claimed);
            return Err(e);
        }

        Ok(claimed.into_iter().map(|slot| slot.record).collect())
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        self.memory.status_counts().await
    }

    async fn close(&self) -> Result<()> {
        self.journal.sync()?;
        info!(records = self.memory.len(), "File store closed");
        Ok(())
    }
}
