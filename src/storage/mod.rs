//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! Storage (Box<dyn RecordStore>)
//!   ├─→ MemoryStore   DashMap<RecordId, Slot>, per-record conditional updates
//!   └─→ FileStore     MemoryStore + append-only Journal
//! ```
//!
//! ## Claiming
//!
//! `RecordStore::try_claim_batch` is the only concurrency-critical
//! primitive. It is built from per-record compare-and-swap transitions
//! (`unused` → `used`) rather than a lock over the whole pool, so two
//! concurrent claims always receive disjoint records.
//!
//! ## Durability
//!
//! `FileStore` journals every mutation as one checksummed batch and
//! rebuilds its index from the journal on open.

pub mod engine;
pub mod file;
pub(crate) mod journal;
pub mod memory;

pub use engine::{RecordStore, StatusCounts, Storage, StoreOptions};
pub use file::FileStore;
pub use memory::MemoryStore;
