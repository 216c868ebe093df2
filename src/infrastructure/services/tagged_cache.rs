//! Tagged cache service - TTL entries with tag-based group invalidation

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::domain::cache::{
    normalize_tags, validate_key, validate_tag, KeyValueStore, Keyspace, DEFAULT_NAMESPACE,
};
use crate::domain::{CacheError, StoreError};

use super::tag_index::{TagIndex, DEFAULT_SCAN_PAGE_SIZE};

/// Configuration for the tagged cache
#[derive(Debug, Clone)]
pub struct TaggedCacheConfig {
    /// Namespace prefixed to every store key
    pub namespace: String,
    /// Members requested per page when invalidating a tag
    pub scan_page_size: usize,
}

impl Default for TaggedCacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }
}

impl TaggedCacheConfig {
    /// Sets the namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the scan page size
    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }
}

/// Cache client storing opaque byte payloads with optional TTL and tags
///
/// Holds no local state besides the store handle, so clones can be shared
/// across any number of concurrent callers.
#[derive(Clone)]
pub struct TaggedCache {
    store: Arc<dyn KeyValueStore>,
    index: TagIndex,
    keyspace: Keyspace,
}

impl std::fmt::Debug for TaggedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedCache")
            .field("index", &self.index)
            .field("store", &"<KeyValueStore>")
            .finish()
    }
}

impl TaggedCache {
    /// Creates a tagged cache with the default namespace
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(store, TaggedCacheConfig::default())
    }

    /// Creates a tagged cache with custom config
    pub fn with_config(store: Arc<dyn KeyValueStore>, config: TaggedCacheConfig) -> Self {
        let keyspace = Keyspace::new(config.namespace);
        let index = TagIndex::new(store.clone(), keyspace.clone())
            .with_scan_page_size(config.scan_page_size);

        Self {
            store,
            index,
            keyspace,
        }
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.index
    }

    /// Stores `value` under `key`, replacing any previous value
    ///
    /// A zero `ttl` means no expiry. `tags` becomes the complete tag set of the
    /// key: tags carried by a previous version and absent here are dropped, and
    /// passing no tags clears them all. Concurrent `set`s of one key end with
    /// the tags of one of them.
    pub async fn set<I, S>(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Duration,
        tags: I,
    ) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        validate_key(key)?;
        let tags = normalize_tags(tags)?;

        self.store
            .put(&self.keyspace.entry(key), value.into(), ttl)
            .await
            .map_err(|e| self.unavailable(format!("can't set value of '{}'", key), e))?;

        self.index.reconcile(key, &tags).await.inspect_err(|e| {
            warn!(key = %key, error = %e, "Value stored but tags not updated");
        })?;

        debug!(key = %key, ttl = ?ttl, tags = tags.len(), "Entry set");

        Ok(())
    }

    /// Returns the payload stored under `key`
    ///
    /// `KeyNotFound` when the key is absent or expired.
    pub async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        validate_key(key)?;

        let value = self
            .store
            .get(&self.keyspace.entry(key))
            .await
            .map_err(|e| self.unavailable(format!("can't get value of '{}'", key), e))?;

        match value {
            Some(value) => Ok(value),
            None => {
                debug!(key = %key, "Cache miss");
                Err(CacheError::key_not_found(key))
            }
        }
    }

    /// Removes `key` and its tag associations; returns whether the entry existed
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;

        self.index.detach(key).await?;

        let deleted = self
            .store
            .delete(&[self.keyspace.entry(key)])
            .await
            .map_err(|e| self.unavailable(format!("can't delete '{}'", key), e))?;

        debug!(key = %key, existed = deleted > 0, "Entry deleted");

        Ok(deleted > 0)
    }

    /// Returns the tags currently attached to `key`
    pub async fn tags(&self, key: &str) -> Result<BTreeSet<String>, CacheError> {
        validate_key(key)?;
        self.index.tags_of(key).await
    }

    /// Deletes every entry carrying `tag`
    ///
    /// Clearing a tag without members succeeds. On a store failure the pages
    /// already committed stay deleted.
    pub async fn clear_by_tag(&self, tag: &str) -> Result<(), CacheError> {
        validate_tag(tag)?;
        self.index.invalidate(tag).await?;
        Ok(())
    }

    fn unavailable(&self, message: String, source: StoreError) -> CacheError {
        warn!(error = %source, "{}", message);
        CacheError::store_unavailable(message, source)
    }
}
