//! Tag index service
//!
//! Keeps two directions of the tag relation in the store:
//! - per tag, the set of entry keys carrying it (`ns:tag:<tag>`)
//! - per entry key, the set of tags it carries (`ns:tags:<key>`)
//!
//! The reverse record is what lets a re-tagged key leave the tags it no longer
//! carries without scanning the keyspace. Every write that depends on a
//! reverse record is guarded by the content read from it; a concurrent change
//! turns the write into a conflict and the read-diff-commit cycle runs again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::cache::{BatchOutcome, KeyValueStore, Keyspace, StoreBatch};
use crate::domain::{CacheError, StoreError};

/// Default number of members requested per scan page
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// Commit attempts before contention is reported as `CacheError::Conflict`
pub const MAX_COMMIT_ATTEMPTS: usize = 16;

/// Membership changes applied by a reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl TagDiff {
    fn between(old: &BTreeSet<String>, new: &BTreeSet<String>) -> Self {
        Self {
            added: new.difference(old).cloned().collect(),
            removed: old.difference(new).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of a completed invalidation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Scan pages processed
    pub pages: usize,
    /// Entries deleted because they still carried the tag
    pub keys_removed: usize,
}

/// Tag membership index over a key-value store
#[derive(Clone)]
pub struct TagIndex {
    store: Arc<dyn KeyValueStore>,
    keyspace: Keyspace,
    scan_page_size: usize,
}

impl std::fmt::Debug for TagIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagIndex")
            .field("keyspace", &self.keyspace)
            .field("scan_page_size", &self.scan_page_size)
            .finish_non_exhaustive()
    }
}

impl TagIndex {
    pub fn new(store: Arc<dyn KeyValueStore>, keyspace: Keyspace) -> Self {
        Self {
            store,
            keyspace,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    /// Sets how many members each scan page requests (at least one)
    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size.max(1);
        self
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn scan_page_size(&self) -> usize {
        self.scan_page_size
    }

    /// Returns the tags currently carried by `key`
    pub async fn tags_of(&self, key: &str) -> Result<BTreeSet<String>, CacheError> {
        let tags = self
            .store
            .set_members(&self.keyspace.reverse(key))
            .await
            .map_err(|e| CacheError::store_unavailable(format!("can't read tags of '{}'", key), e))?;

        Ok(tags.into_iter().collect())
    }

    /// Makes `tags` the exact tag set of `key`
    ///
    /// Memberships in tags no longer listed are removed, new ones are added,
    /// and the reverse record is replaced, all in one atomic batch guarded by
    /// the tags that were read. An empty `tags` detaches the key from everything.
    pub async fn reconcile(
        &self,
        key: &str,
        tags: &BTreeSet<String>,
    ) -> Result<TagDiff, CacheError> {
        let reverse_key = self.keyspace.reverse(key);

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self.tags_of(key).await?;
            let diff = TagDiff::between(&current, tags);

            if diff.is_empty() {
                debug!(key = %key, tags = tags.len(), "Tags unchanged");
                return Ok(diff);
            }

            let mut batch = StoreBatch::new();
            batch.guard(reverse_key.clone(), current.into_iter().collect());

            for tag in &diff.removed {
                batch.set_remove(self.keyspace.tag(tag), vec![key.to_string()]);
            }
            for tag in &diff.added {
                batch.set_add(self.keyspace.tag(tag), vec![key.to_string()]);
            }
            batch
                .delete(vec![reverse_key.clone()])
                .set_add(reverse_key.clone(), tags.iter().cloned().collect());

            let outcome = self.store.execute(batch).await.map_err(|e| {
                CacheError::store_unavailable(format!("can't set tags of '{}'", key), e)
            })?;

            match outcome {
                BatchOutcome::Applied => {
                    debug!(
                        key = %key,
                        added = diff.added.len(),
                        removed = diff.removed.len(),
                        "Tags reconciled"
                    );
                    return Ok(diff);
                }
                BatchOutcome::Conflict => {
                    debug!(key = %key, attempt, "Tags changed concurrently, retrying");
                }
            }
        }

        warn!(key = %key, attempts = MAX_COMMIT_ATTEMPTS, "Giving up on contended tag update");
        Err(CacheError::conflict(format!(
            "tags of '{}' changed on each of {} attempts",
            key, MAX_COMMIT_ATTEMPTS
        )))
    }

    /// Removes `key` from every tag it carries and drops its reverse record
    pub async fn detach(&self, key: &str) -> Result<TagDiff, CacheError> {
        self.reconcile(key, &BTreeSet::new()).await
    }

    /// Deletes every entry carrying `tag`, page by page
    ///
    /// Each page is one atomic batch, guarded by the reverse records of its
    /// members. It deletes the entries that still carry `tag` together with
    /// their reverse records, removes them from the other tags they carry,
    /// and removes the whole page from the tag set. A member re-tagged away
    /// from `tag` before its page commits is left alone. A failing page
    /// aborts the invalidation; pages committed before it stay deleted.
    pub async fn invalidate(&self, tag: &str) -> Result<InvalidationReport, CacheError> {
        let tag_key = self.keyspace.tag(tag);
        let mut report = InvalidationReport::default();
        let mut cursor = 0u64;

        loop {
            let page = self
                .store
                .set_scan(&tag_key, cursor, self.scan_page_size)
                .await
                .map_err(|e| self.page_failed(tag, &report, "can't scan tag", e))?;

            let removed = self.clear_page(tag, &tag_key, &page.members, &report).await?;

            report.pages += 1;
            report.keys_removed += removed;
            debug!(tag = %tag, page = report.pages, keys = removed, "Tag page cleared");

            if page.is_last() {
                break;
            }
            cursor = page.cursor;
        }

        info!(
            tag = %tag,
            pages = report.pages,
            keys_removed = report.keys_removed,
            "Tag invalidated"
        );

        Ok(report)
    }

    async fn clear_page(
        &self,
        tag: &str,
        tag_key: &str,
        members: &[String],
        report: &InvalidationReport,
    ) -> Result<usize, CacheError> {
        if members.is_empty() {
            return Ok(0);
        }

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let (batch, removed) = self
                .page_batch(tag, tag_key, members)
                .await
                .map_err(|e| self.page_failed(tag, report, "can't read tags of members", e))?;

            let outcome = self
                .store
                .execute(batch)
                .await
                .map_err(|e| self.page_failed(tag, report, "can't delete page", e))?;

            match outcome {
                BatchOutcome::Applied => return Ok(removed),
                BatchOutcome::Conflict => {
                    debug!(tag = %tag, attempt, "Page members re-tagged concurrently, retrying");
                }
            }
        }

        warn!(
            tag = %tag,
            pages_committed = report.pages,
            attempts = MAX_COMMIT_ATTEMPTS,
            "Tag invalidation aborted by contention"
        );

        Err(CacheError::conflict(format!(
            "members of tag '{}' changed on each of {} attempts after {} committed page(s)",
            tag, MAX_COMMIT_ATTEMPTS, report.pages
        )))
    }

    /// Builds the guarded batch for one page; also returns how many entries it deletes
    async fn page_batch(
        &self,
        tag: &str,
        tag_key: &str,
        members: &[String],
    ) -> Result<(StoreBatch, usize), StoreError> {
        let reverse_keys: Vec<String> = members.iter().map(|m| self.keyspace.reverse(m)).collect();
        let member_tags = self.store.set_members_many(&reverse_keys).await?;

        let mut batch = StoreBatch::new();
        let mut doomed = Vec::new();
        let mut removed = 0;
        // other tag set -> members to drop from it
        let mut detached: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for ((member, reverse_key), tags) in members.iter().zip(reverse_keys).zip(member_tags) {
            let carried = tags.iter().any(|t| t == tag);

            if carried {
                for other in tags.iter().filter(|t| *t != tag) {
                    detached
                        .entry(self.keyspace.tag(other))
                        .or_default()
                        .push(member.clone());
                }
                doomed.push(self.keyspace.entry(member));
                doomed.push(reverse_key.clone());
                removed += 1;
            }

            batch.guard(reverse_key, tags);
        }

        batch.delete(doomed);

        for (other_key, members) in detached {
            batch.set_remove(other_key, members);
        }
        batch.set_remove(tag_key, members.to_vec());

        Ok((batch, removed))
    }

    fn page_failed(
        &self,
        tag: &str,
        report: &InvalidationReport,
        message: &str,
        source: StoreError,
    ) -> CacheError {
        warn!(
            tag = %tag,
            pages_committed = report.pages,
            error = %source,
            "Tag invalidation aborted"
        );

        CacheError::store_unavailable(
            format!(
                "{} '{}' after {} committed page(s)",
                message, tag, report.pages
            ),
            source,
        )
    }
}
