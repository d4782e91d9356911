// recordpool - shared account pool
// Records are browsed and edited one at a time, and handed out in
// disjoint batches through the claim allocator.

#![warn(rust_2018_idioms)]

pub mod allocator;
pub mod config;
pub mod export;
pub mod metrics;
pub mod record;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use allocator::{ClaimAllocator, ClaimBatch};
pub use record::{NewRecord, Record, RecordFilter, RecordId, RecordPatch, RecordStatus};
pub use storage::{FileStore, MemoryStore, RecordStore, Storage};

/// recordpool error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid request: {0}")]
        InvalidRequest(String),

        #[error("Unauthorized")]
        Unauthorized,

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Validation error: {0}")]
        ValidationError(String),

        #[error("Store unavailable: {0}")]
        StoreUnavailable(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Stable machine-readable error kind, used in API responses.
        pub fn kind(&self) -> &'static str {
            match self {
                Error::InvalidRequest(_) => "invalid_request",
                Error::Unauthorized => "unauthorized",
                Error::NotFound(_) => "not_found",
                Error::ValidationError(_) => "validation_error",
                Error::StoreUnavailable(_) => "store_unavailable",
                Error::Internal(_) => "internal",
            }
        }
    }

    impl From<std::io::Error> for Error {
        fn from(e: std::io::Error) -> Self {
            Error::StoreUnavailable(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
