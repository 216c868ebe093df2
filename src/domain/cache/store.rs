//! Key-value store capability the tagged cache is built on

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::StoreError;

#[cfg(test)]
use mockall::automock;

/// One page of a cursor-based set scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; `0` once the scan is complete
    pub cursor: u64,
    /// Members returned by this page (may repeat across pages)
    pub members: Vec<String>,
}

impl ScanPage {
    pub fn new(cursor: u64, members: Vec<String>) -> Self {
        Self { cursor, members }
    }

    /// Returns true when no further page needs to be requested
    pub fn is_last(&self) -> bool {
        self.cursor == 0
    }
}

/// Single mutation inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Deletes keys of any kind
    Delete(Vec<String>),
    /// Adds members to a set, creating it if needed
    SetAdd { key: String, members: Vec<String> },
    /// Removes members from a set; an emptied set disappears
    SetRemove { key: String, members: Vec<String> },
}

/// Expected exact content of a set, checked before a batch applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetGuard {
    pub key: String,
    /// Expected members; empty means the set must not exist
    pub members: Vec<String>,
}

/// Result of executing a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every guard held and the operations were applied
    Applied,
    /// A guarded set changed since it was read; nothing was applied
    Conflict,
}

/// Ordered list of mutations executed as one unit, optionally guarded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreBatch {
    guards: Vec<SetGuard>,
    ops: Vec<BatchOp>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the batch conditional on `key` holding exactly `members`
    pub fn guard(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        self.guards.push(SetGuard {
            key: key.into(),
            members,
        });
        self
    }

    /// Queues a delete; no-op for an empty key list
    pub fn delete(&mut self, keys: Vec<String>) -> &mut Self {
        if !keys.is_empty() {
            self.ops.push(BatchOp::Delete(keys));
        }
        self
    }

    /// Queues a set add; no-op for an empty member list
    pub fn set_add(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(BatchOp::SetAdd {
                key: key.into(),
                members,
            });
        }
        self
    }

    /// Queues a set remove; no-op for an empty member list
    pub fn set_remove(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(BatchOp::SetRemove {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn guards(&self) -> &[SetGuard] {
        &self.guards
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// True when there is nothing to apply; guards alone do not count
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_parts(self) -> (Vec<SetGuard>, Vec<BatchOp>) {
        (self.guards, self.ops)
    }
}

/// Key-value store with string values, TTLs, set-valued keys and atomic batches
///
/// Implementations hold no knowledge of tags; the keyspace layout is decided by
/// the caller. "Not found" is reported as `Ok(None)` and never as an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Writes a value, replacing any previous value and expiry.
    /// A zero `ttl` stores the value without expiry.
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    /// Reads a value; `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Deletes keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Returns every member of a set; empty when the set does not exist
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Returns the members of several sets, in the order of `keys`
    async fn set_members_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>, StoreError> {
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            results.push(self.set_members(key).await?);
        }

        Ok(results)
    }

    /// Adds members to a set
    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError>;

    /// Removes members from a set
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError>;

    /// Returns one page of a set scan starting at `cursor` (`0` to begin).
    /// `count` is a hint for the page size.
    async fn set_scan(&self, key: &str, cursor: u64, count: usize)
        -> Result<ScanPage, StoreError>;

    /// Executes a batch as one atomic unit
    ///
    /// Guards are checked first, inside the same atomic unit. When any guarded
    /// set differs from its expected content nothing is applied and
    /// `BatchOutcome::Conflict` is returned.
    async fn execute(&self, batch: StoreBatch) -> Result<BatchOutcome, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_skips_empty_operations() {
        let mut batch = StoreBatch::new();
        batch
            .delete(vec![])
            .set_add("s", vec![])
            .set_remove("s", vec![]);

        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }

    #[test]
    fn test_batch_preserves_order() {
        let mut batch = StoreBatch::new();
        batch
            .set_remove("old", vec!["k".to_string()])
            .set_add("new", vec!["k".to_string()])
            .delete(vec!["x".to_string()]);

        assert_eq!(
            batch.ops(),
            &[
                BatchOp::SetRemove {
                    key: "old".to_string(),
                    members: vec!["k".to_string()],
                },
                BatchOp::SetAdd {
                    key: "new".to_string(),
                    members: vec!["k".to_string()],
                },
                BatchOp::Delete(vec!["x".to_string()]),
            ]
        );
    }

    #[test]
    fn test_guards_do_not_make_batch_non_empty() {
        let mut batch = StoreBatch::new();
        batch.guard("tags:k", vec!["a".to_string()]);

        assert!(batch.is_empty());
        assert_eq!(
            batch.guards(),
            &[SetGuard {
                key: "tags:k".to_string(),
                members: vec!["a".to_string()],
            }]
        );

        batch.delete(vec!["k".to_string()]);
        let (guards, ops) = batch.into_parts();
        assert_eq!(guards.len(), 1);
        assert_eq!(ops, vec![BatchOp::Delete(vec!["k".to_string()])]);
    }

    #[test]
    fn test_scan_page_is_last() {
        assert!(ScanPage::new(0, vec![]).is_last());
        assert!(!ScanPage::new(42, vec!["a".to_string()]).is_last());
    }
}
