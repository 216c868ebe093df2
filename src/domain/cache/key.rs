//! Physical key layout for entries, tag sets and reverse records

use std::collections::BTreeSet;

use crate::domain::CacheError;

/// Separator between keyspace segments; not allowed inside tag names
pub const KEY_SEPARATOR: char = ':';

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "recache";

const ENTRY_SEGMENT: &str = "entry";
const TAG_SEGMENT: &str = "tag";
const REVERSE_SEGMENT: &str = "tags";

/// Maps logical cache names onto one flat store keyspace
///
/// Layout under namespace `ns`:
/// - entry `k`            -> `ns:entry:k`
/// - tag `t`              -> `ns:tag:t`
/// - reverse record of `k` -> `ns:tags:k`
///
/// The fixed segment after the namespace keeps the three kinds apart even
/// when entry keys themselves contain the separator.
///
/// Only entries carry a TTL. When a tagged entry expires, its reverse record
/// and its tag memberships stay behind until the key is set again, deleted,
/// or one of its tags is cleared. Store memory therefore grows with the number
/// of distinct tagged keys that were never cleared. Workloads with unbounded
/// key churn should clear their tags periodically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    namespace: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Store key holding the payload of an entry
    pub fn entry(&self, key: &str) -> String {
        self.join(ENTRY_SEGMENT, key)
    }

    /// Store key of a tag's membership set
    pub fn tag(&self, tag: &str) -> String {
        self.join(TAG_SEGMENT, tag)
    }

    /// Store key of the set of tags currently carried by an entry
    pub fn reverse(&self, key: &str) -> String {
        self.join(REVERSE_SEGMENT, key)
    }

    fn join(&self, segment: &str, name: &str) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.namespace,
            segment,
            name,
            sep = KEY_SEPARATOR
        )
    }
}

/// Rejects empty entry keys
pub fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::invalid_argument("key must not be empty"));
    }

    Ok(())
}

/// Rejects empty tag names and names containing the keyspace separator
pub fn validate_tag(tag: &str) -> Result<(), CacheError> {
    if tag.is_empty() {
        return Err(CacheError::invalid_argument("tag must not be empty"));
    }

    if tag.contains(KEY_SEPARATOR) {
        return Err(CacheError::invalid_argument(format!(
            "tag '{}' must not contain '{}'",
            tag, KEY_SEPARATOR
        )));
    }

    Ok(())
}

/// Validates tag names and collapses duplicates into a sorted set
pub fn normalize_tags<I, S>(tags: I) -> Result<BTreeSet<String>, CacheError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = BTreeSet::new();

    for tag in tags {
        let tag = tag.as_ref();
        validate_tag(tag)?;
        normalized.insert(tag.to_string());
    }

    Ok(normalized)
}
