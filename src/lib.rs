//! recache
//!
//! A cache client storing opaque byte payloads under string keys with:
//! - Optional per-entry TTL
//! - Tags for group invalidation (`clear_by_tag`)
//! - Redis or in-process backends behind one store capability

pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::AppConfig;
pub use domain::{CacheError, KeyValueStore, StoreError};
pub use infrastructure::cache::{
    InMemoryStore, RedisStore, RedisStoreConfig, StoreConfig, StoreFactory, StoreType,
};
pub use infrastructure::services::{TagIndex, TaggedCache, TaggedCacheConfig};
