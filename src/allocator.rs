//! Claim allocator
//!
//! Hands out batches of unused records. All the atomicity lives in
//! `RecordStore::try_claim_batch`; the allocator validates the request,
//! delegates once, and reports the outcome. A short or empty batch is a
//! final answer, never retried.

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics::{self, ClaimOutcome};
use crate::record::Record;
use crate::storage::Storage;

/// A claimed batch
#[derive(Debug, Clone)]
pub struct ClaimBatch {
    /// Number of records asked for
    pub requested: usize,
    /// Records now marked `used`, in store order
    pub records: Vec<Record>,
}

impl ClaimBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fewer records than requested were available
    pub fn is_partial(&self) -> bool {
        self.records.len() < self.requested
    }

    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.records.len())
    }
}

/// Claim allocator
///
/// Holds no state between calls; every claim runs against the current
/// store contents.
#[derive(Debug, Clone)]
pub struct ClaimAllocator {
    storage: Arc<Storage>,
}

impl ClaimAllocator {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Claim up to `requested` unused records.
    ///
    /// Fails with `InvalidRequest` for non-positive counts without touching
    /// the store.
    #[instrument(skip(self))]
    pub async fn claim_accounts(&self, requested: i64) -> Result<ClaimBatch> {
        let requested = match usize::try_from(requested) {
            Ok(n) if n > 0 => n,
            _ => {
                warn!(requested, "Rejected claim with non-positive count");
                metrics::record_claim(ClaimOutcome::Rejected, 0);
                return Err(Error::InvalidRequest(format!(
                    "count must be a positive integer, got {}",
                    requested
                )));
            }
        };

        let records = match self.storage.try_claim_batch(requested).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, requested, "Claim failed");
                metrics::record_claim(ClaimOutcome::Failed, 0);
                return Err(e);
            }
        };

        let batch = ClaimBatch { requested, records };
        let outcome = if batch.is_empty() {
            ClaimOutcome::Empty
        } else if batch.is_partial() {
            ClaimOutcome::Partial
        } else {
            ClaimOutcome::Full
        };
        metrics::record_claim(outcome, batch.len());

        if batch.is_partial() {
            warn!(
                requested,
                returned = batch.len(),
                shortfall = batch.shortfall(),
                "Pool exhausted, claim partially fulfilled"
            );
        } else {
            info!(requested, returned = batch.len(), "Claim fulfilled");
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{NewRecord, RecordFilter, RecordStatus};
    use crate::storage::MemoryStore;
    use std::collections::HashSet;

    async fn allocator_with(statuses: &[&str]) -> (ClaimAllocator, Arc<Storage>) {
        let storage = Arc::new(Storage::new(Box::new(MemoryStore::new())));
        for (i, status) in statuses.iter().enumerate() {
            storage
                .insert(NewRecord::named(format!("user{}", i)).with_status(*status))
                .await
                .unwrap();
        }
        (ClaimAllocator::new(storage.clone()), storage)
    }

    async fn statuses(storage: &Storage) -> Vec<RecordStatus> {
        storage
            .find(&RecordFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect()
    }

    #[tokio::test]
    async fn test_invalid_counts_are_rejected_before_mutation() {
        let (allocator, storage) = allocator_with(&["unused", "unused"]).await;
        let before = statuses(&storage).await;

        for count in [0, -5, i64::MIN] {
            let err = allocator.claim_accounts(count).await.unwrap_err();
            assert_eq!(err.kind(), "invalid_request");
        }

        assert_eq!(statuses(&storage).await, before);
    }

    #[tokio::test]
    async fn test_scenario_two_unused_one_used() {
        let (allocator, storage) = allocator_with(&["unused", "unused", "used"]).await;
        let all = storage.find(&RecordFilter::default()).await.unwrap();

        let batch = allocator.claim_accounts(2).await.unwrap();
        let ids: HashSet<_> = batch.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, HashSet::from([all[0].id, all[1].id]));
        assert!(!batch.is_partial());

        let next = allocator.claim_accounts(1).await.unwrap();
        assert!(next.is_empty());
        assert!(next.is_partial());
        assert_eq!(next.shortfall(), 1);
    }

    #[tokio::test]
    async fn test_shortfall_is_success() {
        let (allocator, storage) = allocator_with(&["unused", "unused", "unused"]).await;

        let batch = allocator.claim_accounts(10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.requested, 10);
        assert_eq!(batch.shortfall(), 7);
        assert_eq!(storage.status_counts().await.unwrap().unused(), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_returns_empty_batch() {
        let (allocator, _storage) = allocator_with(&["used", "processed", "invalid"]).await;
        let batch = allocator.claim_accounts(5).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_record_race_has_one_winner() {
        let (allocator, _storage) = allocator_with(&["unused"]).await;

        let a = allocator.clone();
        let b = allocator.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.claim_accounts(1).await }),
            tokio::spawn(async move { b.claim_accounts(1).await }),
        );
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();

        assert_eq!(first.len() + second.len(), 1);
    }
}
