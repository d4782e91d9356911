//! In-memory record store
//!
//! Records live in a sharded `DashMap`. Each slot carries the record, a
//! per-record version bumped on every mutation, and the insertion sequence
//! used to keep scans in insertion order.
//!
//! The claim path never holds more than one entry lock at a time:
//!
//! ```text
//! scan unused ids (no locks kept) ──→ for each id: lock entry
//!                                        status == unused ? flip to used : skip
//!                                     stop once max_count flipped
//! ```
//!
//! Losing a record to a concurrent claim between the scan and the lock is
//! harmless: the conditional check fails and the record is skipped.

use crate::error::{Error, Result};
use crate::record::{NewRecord, Record, RecordFilter, RecordId, RecordPatch, RecordStatus};
use crate::storage::engine::{RecordStore, StatusCounts, StoreOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

/// A record together with its bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Slot {
    pub record: Record,
    /// Bumped on every mutation; starts at 1
    pub version: u64,
    /// Insertion order
    pub seq: u64,
    /// Token of the claim that last moved this record to `used`; 0 if never
    #[serde(default)]
    pub claim: u64,
}

/// In-memory record store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    slots: DashMap<RecordId, Slot>,
    next_seq: AtomicU64,
    next_claim: AtomicU64,
    options: StoreOptions,
}

impl MemoryStore {
    /// Create an empty store with default options
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                next_seq: AtomicU64::new(0),
                next_claim: AtomicU64::new(1),
                options,
            }),
        }
    }

    /// Number of records stored
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub(crate) fn insert_slot(&self, record: Record) -> Slot {
        let slot = Slot {
            record,
            version: 1,
            seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
            claim: 0,
        };
        self.inner.slots.insert(slot.record.id, slot.clone());
        slot
    }

    /// Returns (previous, current)
    pub(crate) fn update_slot(&self, id: RecordId, patch: &RecordPatch) -> Result<(Slot, Slot)> {
        let mut entry = self
            .inner
            .slots
            .get_mut(&id)
            .ok_or_else(|| not_found(id))?;
        let previous = entry.value().clone();
        patch.apply(&mut entry.record)?;
        entry.version += 1;
        Ok((previous, entry.value().clone()))
    }

    pub(crate) fn remove_slot(&self, id: RecordId) -> Result<Slot> {
        self.inner
            .slots
            .remove(&id)
            .map(|(_, slot)| slot)
            .ok_or_else(|| not_found(id))
    }

    /// Conditional update on a single record.
    ///
    /// `apply` runs only if `guard` holds, both under the entry lock, so no
    /// other mutation of the same record can interleave.
    pub(crate) fn transition<G, A>(&self, id: &RecordId, guard: G, apply: A) -> Option<Slot>
    where
        G: FnOnce(&Slot) -> bool,
        A: FnOnce(&mut Slot),
    {
        let mut entry = self.inner.slots.get_mut(id)?;
        if !guard(entry.value()) {
            return None;
        }
        apply(entry.value_mut());
        entry.version += 1;
        Some(entry.value().clone())
    }

    /// Move up to `max_count` unused records to `used`, tagging each with
    /// one fresh claim token.
    pub(crate) fn claim_slots(&self, max_count: usize) -> Vec<Slot> {
        if max_count == 0 {
            return Vec::new();
        }

        let token = self.inner.next_claim.fetch_add(1, Ordering::SeqCst);
        let candidates = self.ids_where(|record| record.status.is_unused());
        let mut claimed = Vec::with_capacity(max_count.min(candidates.len()));

        for id in candidates {
            if claimed.len() == max_count {
                break;
            }
            match self.transition(
                &id,
                |slot| slot.record.status.is_unused(),
                |slot| {
                    slot.record.status = RecordStatus::Used;
                    slot.claim = token;
                },
            ) {
                Some(slot) => claimed.push(slot),
                None => debug!(record = %id, "Record taken concurrently, skipping"),
            }
        }

        claimed
    }

    /// Return a claimed record to the pool.
    ///
    /// Only flips `used` back to `unused` when the record still carries the
    /// claim `token`; other fields edited since the claim are kept. A record
    /// reset and claimed again by someone else is left alone.
    pub(crate) fn release_claim(&self, id: &RecordId, token: u64) -> Option<Slot> {
        self.transition(
            id,
            |slot| slot.claim == token && slot.record.status == RecordStatus::Used,
            |slot| {
                slot.record.status = RecordStatus::Unused;
                slot.claim = 0;
            },
        )
    }

    /// Put back `previous` if the record is still at `written_version`.
    ///
    /// Used to undo a mutation whose durable write failed. A record that
    /// has been mutated again since is left alone.
    pub(crate) fn revert(&self, previous: Slot, written_version: u64) {
        let id = previous.record.id;
        if let Some(mut entry) = self.inner.slots.get_mut(&id) {
            if entry.version == written_version {
                *entry = previous;
            }
        }
    }

    /// Remove a freshly inserted record if nothing touched it since.
    pub(crate) fn revert_insert(&self, id: RecordId, written_version: u64) {
        self.inner
            .slots
            .remove_if(&id, |_, slot| slot.version == written_version);
    }

    /// Re-insert a deleted record unless the id was reused meanwhile.
    pub(crate) fn revert_delete(&self, previous: Slot) {
        self.inner
            .slots
            .entry(previous.record.id)
            .or_insert(previous);
    }

    /// Load a slot as-is (recovery), keeping the sequence counter ahead.
    pub(crate) fn load_slot(&self, slot: Slot) {
        self.inner
            .next_seq
            .fetch_max(slot.seq + 1, Ordering::SeqCst);
        self.inner
            .next_claim
            .fetch_max(slot.claim + 1, Ordering::SeqCst);
        self.inner.slots.insert(slot.record.id, slot);
    }

    /// All slots in insertion order
    pub(crate) fn snapshot(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        slots
    }

    /// Ids of matching records in insertion order. No entry lock outlives
    /// this call.
    fn ids_where<F>(&self, predicate: F) -> Vec<RecordId>
    where
        F: Fn(&Record) -> bool,
    {
        let mut matching: Vec<(u64, RecordId)> = self
            .inner
            .slots
            .iter()
            .filter(|entry| predicate(&entry.record))
            .map(|entry| (entry.seq, *entry.key()))
            .collect();
        matching.sort_unstable_by_key(|(seq, _)| *seq);
        matching.into_iter().map(|(_, id)| id).collect()
    }
}

fn not_found(id: RecordId) -> Error {
    Error::NotFound(format!("record {}", id))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: NewRecord) -> Result<Record> {
        let record = Record::create(record)?;
        Ok(self.insert_slot(record).record)
    }

    async fn get(&self, id: RecordId) -> Result<Record> {
        self.inner
            .slots
            .get(&id)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<Record> {
        self.update_slot(id, &patch).map(|(_, slot)| slot.record)
    }

    async fn delete(&self, id: RecordId) -> Result<()> {
        self.remove_slot(id).map(|_| ())
    }

    async fn find(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let case_insensitive = self.inner.options.case_insensitive_search;
        let mut matching: Vec<(u64, Record)> = self
            .inner
            .slots
            .iter()
            .filter(|entry| filter.matches(&entry.record, case_insensitive))
            .map(|entry| (entry.seq, entry.record.clone()))
            .collect();
        matching.sort_by_key(|(seq, _)| *seq);
        Ok(matching.into_iter().map(|(_, record)| record).collect())
    }

    #[instrument(skip(self))]
    async fn try_claim_batch(&self, max_count: usize) -> Result<Vec<Record>> {
        let claimed = self.claim_slots(max_count);
        debug!(claimed = claimed.len(), "Claimed records");
        Ok(claimed.into_iter().map(|slot| slot.record).collect())
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.inner.slots.iter() {
            counts.add(&entry.record.status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn seeded(store: &MemoryStore, names: &[(&str, &str)]) -> Vec<Record> {
        let mut records = Vec::new();
        for (name, status) in names {
            let record = store
                .insert(NewRecord::named(*name).with_status(*status))
                .await
                .unwrap();
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn test_memory_store_basic_ops() -> Result<()> {
        let store = MemoryStore::new();

        let created = store.insert(NewRecord::named("alice")).await?;
        assert_eq!(store.get(created.id).await?, created);

        let updated = store
            .update(created.id, RecordPatch::status("processed"))
            .await?;
        assert_eq!(updated.status, RecordStatus::Processed);
        assert_eq!(updated.name, "alice");

        store.delete(created.id).await?;
        assert!(matches!(store.get(created.id).await, Err(Error::NotFound(_))));
        assert!(matches!(store.delete(created.id).await, Err(Error::NotFound(_))));
        assert!(store.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let store = MemoryStore::new();
        let result = store.update(RecordId::new(), RecordPatch::status("used")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_insert_without_name_is_rejected() {
        let store = MemoryStore::new();
        let result = store.insert(NewRecord::default()).await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_find_is_insertion_ordered_and_filtered() -> Result<()> {
        let store = MemoryStore::new();
        seeded(
            &store,
            &[
                ("Alpha", "unused"),
                ("beta", "used"),
                ("alphabet", "unused"),
                ("gamma", "invalid"),
            ],
        )
        .await;

        let all = store.find(&RecordFilter::default()).await?;
        let names: Vec<&str> = all.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "beta", "alphabet", "gamma"]);

        let alphas = store.find(&RecordFilter::by_name("alpha")).await?;
        assert_eq!(alphas.len(), 2);

        let unused_alphas = store
            .find(&RecordFilter {
                name: Some("ALPHA".to_string()),
                status: Some(RecordStatus::Unused),
            })
            .await?;
        assert_eq!(unused_alphas.len(), 2);

        let used = store.find(&RecordFilter::by_status("used")).await?;
        assert_eq!(used.len(), 1);
        assert_eq!(used[0].name, "beta");

        Ok(())
    }

    #[tokio::test]
    async fn test_case_sensitive_search_option() -> Result<()> {
        let store = MemoryStore::with_options(StoreOptions {
            case_insensitive_search: false,
        });
        seeded(&store, &[("Alpha", "unused")]).await;

        assert!(store.find(&RecordFilter::by_name("alpha")).await?.is_empty());
        assert_eq!(store.find(&RecordFilter::by_name("Alp")).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_skips_non_unused_records() -> Result<()> {
        let store = MemoryStore::new();
        let records = seeded(&store, &[("a", "unused"), ("b", "unused"), ("c", "used")]).await;

        let batch = store.try_claim_batch(2).await?;
        let claimed: HashSet<RecordId> = batch.iter().map(|r| r.id).collect();
        assert_eq!(claimed, HashSet::from([records[0].id, records[1].id]));
        assert!(batch.iter().all(|r| r.status == RecordStatus::Used));

        for record in &batch {
            assert_eq!(store.get(record.id).await?.status, RecordStatus::Used);
        }

        assert!(store.try_claim_batch(1).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_shortfall_returns_everything_available() -> Result<()> {
        let store = MemoryStore::new();
        seeded(&store, &[("a", "unused"), ("b", "unused"), ("c", "unused")]).await;

        let batch = store.try_claim_batch(10).await?;
        assert_eq!(batch.len(), 3);
        assert_eq!(store.status_counts().await?.unused(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_zero_is_empty() -> Result<()> {
        let store = MemoryStore::new();
        seeded(&store, &[("a", "unused")]).await;
        assert!(store.try_claim_batch(0).await?.is_empty());
        assert_eq!(store.status_counts().await?.unused(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_follows_insertion_order() -> Result<()> {
        let store = MemoryStore::new();
        seeded(&store, &[("first", "unused"), ("second", "unused"), ("third", "unused")]).await;

        let batch = store.try_claim_batch(2).await?;
        let names: Vec<&str> = batch.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_record_returns_to_pool() -> Result<()> {
        let store = MemoryStore::new();
        let records = seeded(&store, &[("a", "unused")]).await;

        assert_eq!(store.try_claim_batch(1).await?.len(), 1);
        assert!(store.try_claim_batch(1).await?.is_empty());

        store
            .update(records[0].id, RecordPatch::status(RecordStatus::Unused))
            .await?;
        let again = store.try_claim_batch(1).await?;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, records[0].id);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_disjoint() -> Result<()> {
        let store = MemoryStore::new();
        for i in 0..500 {
            store.insert(NewRecord::named(format!("user{}", i))).await?;
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.try_claim_batch(40).await }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            let batch = handle.await.expect("claim task panicked")?;
            total += batch.len();
            for record in batch {
                assert!(seen.insert(record.id), "record {} claimed twice", record.id);
            }
        }

        assert_eq!(total, 500);
        let counts = store.status_counts().await?;
        assert_eq!(counts.total, 500);
        assert_eq!(counts.get(&RecordStatus::Used), 500);
        Ok(())
    }

    #[test]
    fn test_revert_respects_newer_versions() {
        let store = MemoryStore::new();
        let slot = store.insert_slot(Record::create(NewRecord::named("a")).unwrap());

        let claimed = store.claim_slots(1);
        assert_eq!(claimed.len(), 1);
        let written = claimed[0].version;

        // Someone else touched the record after the claim.
        store
            .update_slot(slot.record.id, &RecordPatch::status("processed"))
            .unwrap();
        store.revert(slot.clone(), written);
        assert_eq!(
            store.snapshot()[0].record.status,
            RecordStatus::Processed
        );

        // Untouched since: reverted.
        let (previous, current) = store
            .update_slot(slot.record.id, &RecordPatch::status("invalid"))
            .unwrap();
        store.revert(previous, current.version);
        assert_eq!(
            store.snapshot()[0].record.status,
            RecordStatus::Processed
        );
    }

    #[test]
    fn test_release_keeps_concurrent_edits() {
        let store = MemoryStore::new();
        store.insert_slot(Record::create(NewRecord::named("a")).unwrap());

        let claimed = store.claim_slots(1);
        let id = claimed[0].record.id;
        store
            .update_slot(
                id,
                &RecordPatch {
                    notes: Some("checked".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let released = store.release_claim(&id, claimed[0].claim).unwrap();
        assert_eq!(released.record.status, RecordStatus::Unused);
        assert_eq!(released.record.notes, "checked");
    }

    #[test]
    fn test_release_ignores_records_claimed_again() {
        let store = MemoryStore::new();
        store.insert_slot(Record::create(NewRecord::named("a")).unwrap());

        let first = store.claim_slots(1);
        let id = first[0].record.id;
        store
            .update_slot(id, &RecordPatch::status(RecordStatus::Unused))
            .unwrap();
        let second = store.claim_slots(1);
        assert_ne!(first[0].claim, second[0].claim);

        assert!(store.release_claim(&id, first[0].claim).is_none());
        assert_eq!(store.snapshot()[0].record.status, RecordStatus::Used);
        assert_eq!(store.snapshot()[0].claim, second[0].claim);
    }
}
