//! In-process key-value store with TTLs, scannable sets and atomic batches

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::cache::{BatchOp, BatchOutcome, KeyValueStore, ScanPage, SetGuard, StoreBatch};
use crate::domain::StoreError;

/// Set members keyed by insertion sequence so a scan cursor stays valid while
/// other members are removed between pages
#[derive(Debug, Default)]
struct MemberSet {
    by_member: HashMap<String, u64>,
    by_seq: BTreeMap<u64, String>,
}

impl MemberSet {
    fn insert(&mut self, member: &str, seq: u64) -> bool {
        if self.by_member.contains_key(member) {
            return false;
        }
        self.by_member.insert(member.to_string(), seq);
        self.by_seq.insert(seq, member.to_string());
        true
    }

    fn remove(&mut self, member: &str) {
        if let Some(seq) = self.by_member.remove(member) {
            self.by_seq.remove(&seq);
        }
    }

    fn holds_exactly(&self, expected: &BTreeSet<&str>) -> bool {
        self.by_member.len() == expected.len()
            && expected.iter().all(|m| self.by_member.contains_key(*m))
    }

    fn members(&self) -> Vec<String> {
        self.by_seq.values().cloned().collect()
    }

    fn scan(&self, cursor: u64, count: usize) -> ScanPage {
        let mut members = Vec::new();
        let mut last_seq = None;

        for (seq, member) in self.by_seq.range(cursor.max(1)..).take(count.max(1)) {
            members.push(member.clone());
            last_seq = Some(*seq);
        }

        let next_cursor = match last_seq {
            Some(seq) if self.by_seq.range(seq + 1..).next().is_some() => seq + 1,
            _ => 0,
        };

        ScanPage::new(next_cursor, members)
    }

    fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }
}

#[derive(Debug)]
enum SlotData {
    Value(Bytes),
    Set(MemberSet),
}

#[derive(Debug)]
struct Slot {
    data: SlotData,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<String, Slot>,
    // Scan cursors start at 1; 0 means "begin" or "done"
    next_seq: u64,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();

        if self.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.slots.remove(key);
        }

        self.slots.get_mut(key)
    }

    fn set_of(&mut self, key: &str) -> Result<Option<&MemberSet>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                data: SlotData::Set(set),
                ..
            }) => Ok(Some(&*set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn guard_holds(&mut self, guard: &SetGuard) -> Result<bool, StoreError> {
        let expected: BTreeSet<&str> = guard.members.iter().map(String::as_str).collect();

        Ok(match self.set_of(&guard.key)? {
            Some(set) => set.holds_exactly(&expected),
            None => expected.is_empty(),
        })
    }

    fn put(&mut self, key: &str, value: Bytes, ttl: Duration) {
        // A TTL beyond the clock's range never expires
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };

        self.slots.insert(
            key.to_string(),
            Slot {
                data: SlotData::Value(value),
                expires_at,
            },
        );
    }

    fn delete(&mut self, keys: &[String]) -> u64 {
        let mut deleted = 0;

        for key in keys {
            if self.live(key).is_some() {
                self.slots.remove(key);
                deleted += 1;
            }
        }

        deleted
    }

    fn set_add(&mut self, key: &str, members: &[String]) -> Result<(), StoreError> {
        if self.live(key).is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    data: SlotData::Set(MemberSet::default()),
                    expires_at: None,
                },
            );
        }

        let State { slots, next_seq } = self;
        match slots.get_mut(key).map(|slot| &mut slot.data) {
            Some(SlotData::Set(set)) => {
                for member in members {
                    let seq = *next_seq + 1;
                    if set.insert(member, seq) {
                        *next_seq = seq;
                    }
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn set_remove(&mut self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let emptied = match self.live(key).map(|slot| &mut slot.data) {
            None => return Ok(()),
            Some(SlotData::Set(set)) => {
                for member in members {
                    set.remove(member);
                }
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };

        if emptied {
            self.slots.remove(key);
        }

        Ok(())
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::new(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// Thread-safe in-process store
///
/// Follows Redis semantics where the tagged cache depends on them:
/// - one flat keyspace shared by values and sets
/// - empty sets do not exist
/// - expiry checked lazily on access
/// - a batch runs under a single lock, so no other call observes it half-applied
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys of any kind
    pub fn len(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let state = self.lock()?;

        Ok(state
            .slots
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Returns true when a live key of any kind exists
    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.live(key).is_some())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::new(format!("In-memory store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.lock()?.put(key, value, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut state = self.lock()?;

        match state.live(key).map(|slot| &slot.data) {
            None => Ok(None),
            Some(SlotData::Value(value)) => Ok(Some(value.clone())),
            Some(SlotData::Set(_)) => Err(wrong_type(key)),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        Ok(self.lock()?.delete(keys))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock()?;
        Ok(state.set_of(key)?.map(MemberSet::members).unwrap_or_default())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        self.lock()?.set_add(key, members)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        self.lock()?.set_remove(key, members)
    }

    async fn set_scan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, StoreError> {
        let mut state = self.lock()?;

        Ok(state
            .set_of(key)?
            .map(|set| set.scan(cursor, count))
            .unwrap_or_default())
    }

    async fn execute(&self, batch: StoreBatch) -> Result<BatchOutcome, StoreError> {
        let (guards, ops) = batch.into_parts();
        let mut state = self.lock()?;

        for guard in &guards {
            if !state.guard_holds(guard)? {
                return Ok(BatchOutcome::Conflict);
            }
        }

        // Like EXEC, a failing command does not undo the ones before it
        for op in ops {
            match op {
                BatchOp::Delete(keys) => {
                    state.delete(&keys);
                }
                BatchOp::SetAdd { key, members } => state.set_add(&key, &members)?,
                BatchOp::SetRemove { key, members } => state.set_remove(&key, &members)?,
            }
        }

        Ok(BatchOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryStore::new();

        store
            .put("key1", Bytes::from_static(b"value1"), Duration::ZERO)
            .await
            .unwrap();

        let result = store.get("key1").await.unwrap();
        assert_eq!(result, Some(Bytes::from_static(b"value1")));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = InMemoryStore::new();

        let result = store.get("missing").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = InMemoryStore::new();

        store
            .put("key1", Bytes::from_static(b"old"), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put("key1", Bytes::from_static(b"new"), Duration::ZERO)
            .await
            .unwrap();

        let result = store.get("key1").await.unwrap();
        assert_eq!(result, Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let store = InMemoryStore::new();

        store
            .put("expiring", Bytes::from_static(b"v"), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(store.get("expiring").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.get("expiring").await.unwrap().is_none());
        assert!(!store.contains("expiring").unwrap());
    }

    #[tokio::test]
    async fn test_delete_counts_existing_keys() {
        let store = InMemoryStore::new();
        store
            .put("a", Bytes::from_static(b"1"), Duration::ZERO)
            .await
            .unwrap();
        store.set_add("s", &strings(&["m"])).await.unwrap();

        let deleted = store.delete(&strings(&["a", "s", "missing"])).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_set_add_and_members() {
        let store = InMemoryStore::new();

        store.set_add("s", &strings(&["b", "a", "b"])).await.unwrap();

        let mut members = store.set_members("s").await.unwrap();
        members.sort();
        assert_eq!(members, strings(&["a", "b"]));
        assert!(store.set_members("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emptied_set_disappears() {
        let store = InMemoryStore::new();

        store.set_add("s", &strings(&["a"])).await.unwrap();
        store.set_remove("s", &strings(&["a"])).await.unwrap();

        assert!(!store.contains("s").unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = InMemoryStore::new();
        store
            .put("value", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        store.set_add("set", &strings(&["m"])).await.unwrap();

        assert!(store.set_add("value", &strings(&["m"])).await.is_err());
        assert!(store.set_members("value").await.is_err());
        assert!(store.get("set").await.is_err());
    }

    #[tokio::test]
    async fn test_scan_pages_cover_whole_set() {
        let store = InMemoryStore::new();
        let members: Vec<String> = (0..25).map(|i| format!("m{}", i)).collect();
        store.set_add("s", &members).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = 0;
        let mut pages = 0;

        loop {
            let page = store.set_scan("s", cursor, 10).await.unwrap();
            assert!(page.members.len() <= 10);
            seen.extend(page.members);
            pages += 1;
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        assert_eq!(pages, 3);
        seen.sort();
        let mut expected = members.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_scan_survives_removals_between_pages() {
        let store = InMemoryStore::new();
        store
            .set_add("s", &strings(&["a", "b", "c", "d"]))
            .await
            .unwrap();

        let first = store.set_scan("s", 0, 2).await.unwrap();
        assert_eq!(first.members, strings(&["a", "b"]));

        // Removing already returned members must not shift the cursor
        store.set_remove("s", &strings(&["a", "b"])).await.unwrap();

        let second = store.set_scan("s", first.cursor, 2).await.unwrap();
        assert_eq!(second.members, strings(&["c", "d"]));
        assert_eq!(second.cursor, 0);
    }

    #[tokio::test]
    async fn test_scan_missing_set() {
        let store = InMemoryStore::new();

        let page = store.set_scan("missing", 0, 10).await.unwrap();
        assert_eq!(page, ScanPage::new(0, vec![]));
    }

    #[tokio::test]
    async fn test_execute_batch() {
        let store = InMemoryStore::new();
        store
            .put("entry", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        store.set_add("old", &strings(&["k", "other"])).await.unwrap();

        let mut batch = StoreBatch::new();
        batch
            .delete(strings(&["entry"]))
            .set_remove("old", strings(&["k"]))
            .set_add("new", strings(&["k"]));
        assert_eq!(store.execute(batch).await.unwrap(), BatchOutcome::Applied);

        assert!(store.get("entry").await.unwrap().is_none());
        assert_eq!(store.set_members("old").await.unwrap(), strings(&["other"]));
        assert_eq!(store.set_members("new").await.unwrap(), strings(&["k"]));
    }

    #[tokio::test]
    async fn test_guarded_batch_applies_when_set_unchanged() {
        let store = InMemoryStore::new();
        store.set_add("tags:k", &strings(&["a", "b"])).await.unwrap();

        let mut batch = StoreBatch::new();
        batch
            .guard("tags:k", strings(&["b", "a"]))
            .guard("tags:missing", vec![])
            .delete(strings(&["tags:k"]));

        assert_eq!(store.execute(batch).await.unwrap(), BatchOutcome::Applied);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_guarded_batch_conflicts_without_applying() {
        let store = InMemoryStore::new();
        store.set_add("tags:k", &strings(&["a"])).await.unwrap();
        store.set_add("tag:a", &strings(&["k"])).await.unwrap();

        // Read {a}, then another writer adds b
        store.set_add("tags:k", &strings(&["b"])).await.unwrap();

        let mut batch = StoreBatch::new();
        batch
            .guard("tags:k", strings(&["a"]))
            .set_remove("tag:a", strings(&["k"]))
            .delete(strings(&["tags:k"]));

        assert_eq!(store.execute(batch).await.unwrap(), BatchOutcome::Conflict);
        assert_eq!(store.set_members("tag:a").await.unwrap(), strings(&["k"]));
        assert_eq!(store.set_members("tags:k").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_guard_expecting_absent_set_conflicts_once_created() {
        let store = InMemoryStore::new();
        store.set_add("tags:k", &strings(&["x"])).await.unwrap();

        let mut batch = StoreBatch::new();
        batch
            .guard("tags:k", vec![])
            .set_add("tags:k", strings(&["y"]));

        assert_eq!(store.execute(batch).await.unwrap(), BatchOutcome::Conflict);
        assert_eq!(store.set_members("tags:k").await.unwrap(), strings(&["x"]));
    }

    #[tokio::test]
    async fn test_default_set_members_many() {
        let store = InMemoryStore::new();
        store.set_add("a", &strings(&["1"])).await.unwrap();
        store.set_add("b", &strings(&["2"])).await.unwrap();

        let members = store
            .set_members_many(&strings(&["a", "missing", "b"]))
            .await
            .unwrap();

        assert_eq!(
            members,
            vec![strings(&["1"]), Vec::<String>::new(), strings(&["2"])]
        );
    }
}
