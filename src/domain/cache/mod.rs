//! Cache domain - store capability and keyspace layout for tagged entries

mod key;
mod store;

pub use key::{
    normalize_tags, validate_key, validate_tag, Keyspace, DEFAULT_NAMESPACE, KEY_SEPARATOR,
};
pub use store::{BatchOp, BatchOutcome, KeyValueStore, ScanPage, SetGuard, StoreBatch};

#[cfg(test)]
pub use store::MockKeyValueStore;
