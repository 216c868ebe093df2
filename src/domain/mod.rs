//! Domain layer - Store capability, keyspace layout and errors

pub mod cache;
pub mod error;

pub use cache::{
    normalize_tags, validate_key, validate_tag, BatchOp, BatchOutcome, KeyValueStore, Keyspace,
    ScanPage, SetGuard, StoreBatch,
};
pub use error::{CacheError, StoreError};
