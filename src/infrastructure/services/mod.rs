//! Application services built on the store capability

mod tag_index;
mod tagged_cache;

pub use tag_index::{InvalidationReport, TagDiff, TagIndex, DEFAULT_SCAN_PAGE_SIZE};
pub use tagged_cache::{TaggedCache, TaggedCacheConfig};
