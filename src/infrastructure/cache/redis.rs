//! Redis key-value store implementation

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, RedisError};

use crate::domain::cache::{BatchOp, BatchOutcome, KeyValueStore, ScanPage, SetGuard, StoreBatch};
use crate::domain::{CacheError, StoreError};

/// Configuration for the Redis store
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub url: String,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Per-command response timeout
    pub response_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStoreConfig {
    /// Creates a new configuration with the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Sets the connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the response timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// Redis-backed store
///
/// Features:
/// - PSETEX/SET for values with millisecond TTLs
/// - SSCAN paging for large sets
/// - Guarded batches applied atomically by a Lua script
/// - Reconnects transparently via ConnectionManager
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("connection", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    /// Connects to Redis
    pub async fn new(config: RedisStoreConfig) -> Result<Self, CacheError> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            CacheError::configuration(format!("Invalid Redis URL '{}': {}", config.url, e))
        })?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connection_timeout)
            .set_response_timeout(config.response_timeout);

        let connection = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(|e| {
                CacheError::store_unavailable(
                    "Failed to connect to Redis",
                    store_error("connect", e),
                )
            })?;

        Ok(Self { connection, config })
    }

    /// Connects with default timeouts
    pub async fn with_url(url: impl Into<String>) -> Result<Self, CacheError> {
        Self::new(RedisStoreConfig::new(url)).await
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }
}

fn store_error(action: &str, error: RedisError) -> StoreError {
    StoreError::with_source(format!("Redis {} failed: {}", action, error), error)
}

/// Millisecond expiry for PSETEX; sub-millisecond TTLs round up so they still expire
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Checks every guard, then applies the operations. Returns 1 when applied and
/// 0 when a guarded set differs from its expected members.
///
/// KEYS: one per guard, then the keys of each operation in order.
/// ARGV: guard count; per guard its member count and members; per operation
/// the command, a count (keys for DEL, members for SADD/SREM) and the members.
const GUARDED_BATCH_SCRIPT: &str = r"
local k, a = 1, 1
local guards = tonumber(ARGV[a])
a = a + 1

for _ = 1, guards do
    local key = KEYS[k]
    local n = tonumber(ARGV[a])
    k = k + 1
    a = a + 1
    if redis.call('SCARD', key) ~= n then
        return 0
    end
    for i = a, a + n - 1 do
        if redis.call('SISMEMBER', key, ARGV[i]) == 0 then
            return 0
        end
    end
    a = a + n
end

while a <= #ARGV do
    local op = ARGV[a]
    local n = tonumber(ARGV[a + 1])
    a = a + 2
    if op == 'DEL' then
        for _ = 1, n do
            redis.call('DEL', KEYS[k])
            k = k + 1
        end
    else
        local key = KEYS[k]
        k = k + 1
        for i = a, a + n - 1 do
            redis.call(op, key, ARGV[i])
        end
        a = a + n
    end
end

return 1
";

/// Flattens a batch into the KEYS and ARGV lists of `GUARDED_BATCH_SCRIPT`
fn script_args(guards: Vec<SetGuard>, ops: Vec<BatchOp>) -> (Vec<String>, Vec<String>) {
    let mut keys = Vec::new();
    let mut args = vec![guards.len().to_string()];

    for guard in guards {
        let mut members = guard.members;
        members.sort();
        members.dedup();

        keys.push(guard.key);
        args.push(members.len().to_string());
        args.extend(members);
    }

    for op in ops {
        match op {
            BatchOp::Delete(deleted) => {
                args.push("DEL".to_string());
                args.push(deleted.len().to_string());
                keys.extend(deleted);
            }
            BatchOp::SetAdd { key, members } => {
                keys.push(key);
                args.push("SADD".to_string());
                args.push(members.len().to_string());
                args.extend(members);
            }
            BatchOp::SetRemove { key, members } => {
                keys.push(key);
                args.push("SREM".to_string());
                args.push(members.len().to_string());
                args.extend(members);
            }
        }
    }

    (keys, args)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();

        if ttl.is_zero() {
            let _: () = conn
                .set(key, &value[..])
                .await
                .map_err(|e| store_error("SET", e))?;
        } else {
            let _: () = conn
                .pset_ex(key, &value[..], ttl_millis(ttl))
                .await
                .map_err(|e| store_error("PSETEX", e))?;
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.connection.clone();

        let result: Option<Vec<u8>> = conn.get(key).await.map_err(|e| store_error("GET", e))?;

        Ok(result.map(Bytes::from))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();

        let deleted: u64 = conn.del(keys).await.map_err(|e| store_error("DEL", e))?;

        Ok(deleted)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();

        let members: Vec<String> = conn
            .smembers(key)
            .await
            .map_err(|e| store_error("SMEMBERS", e))?;

        Ok(members)
    }

    async fn set_members_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();

        // Plain pipeline: a read-only round trip, no MULTI needed
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.smembers(key);
        }

        let members: Vec<Vec<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SMEMBERS pipeline", e))?;

        Ok(members)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection.clone();

        let _: () = conn
            .sadd(key, members)
            .await
            .map_err(|e| store_error("SADD", e))?;

        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection.clone();

        let _: () = conn
            .srem(key, members)
            .await
            .map_err(|e| store_error("SREM", e))?;

        Ok(())
    }

    async fn set_scan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, StoreError> {
        let mut conn = self.connection.clone();

        let (next_cursor, members): (u64, Vec<String>) = redis::cmd("SSCAN")
            .arg(key)
            .arg(cursor)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SSCAN", e))?;

        Ok(ScanPage::new(next_cursor, members))
    }

    async fn execute(&self, batch: StoreBatch) -> Result<BatchOutcome, StoreError> {
        if batch.is_empty() && batch.guards().is_empty() {
            return Ok(BatchOutcome::Applied);
        }

        let (guards, ops) = batch.into_parts();
        let (keys, args) = script_args(guards, ops);

        let script = redis::Script::new(GUARDED_BATCH_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        for arg in &args {
            invocation.arg(arg);
        }

        let mut conn = self.connection.clone();

        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("guarded batch", e))?;

        Ok(if applied == 1 {
            BatchOutcome::Applied
        } else {
            BatchOutcome::Conflict
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: the store tests require a running Redis instance
    // Run with: cargo test -- --ignored

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn connect() -> RedisStore {
        RedisStore::with_url("redis://127.0.0.1:6379").await.unwrap()
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(Duration::from_secs(10)), 10_000);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_config_builder() {
        let config = RedisStoreConfig::new("redis://localhost")
            .with_connection_timeout(Duration::from_secs(2))
            .with_response_timeout(Duration::from_millis(500));

        assert_eq!(config.url, "redis://localhost");
        assert_eq!(config.connection_timeout, Duration::from_secs(2));
        assert_eq!(config.response_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_script_args_layout() {
        let mut batch = StoreBatch::new();
        batch
            .guard("tags:k", strings(&["b", "a", "a"]))
            .guard("tags:j", vec![])
            .delete(strings(&["entry:k", "tags:k"]))
            .set_remove("tag:a", strings(&["k"]))
            .set_add("tag:c", strings(&["k", "j"]));

        let (guards, ops) = batch.into_parts();
        let (keys, args) = script_args(guards, ops);

        assert_eq!(
            keys,
            strings(&["tags:k", "tags:j", "entry:k", "tags:k", "tag:a", "tag:c"])
        );
        assert_eq!(
            args,
            strings(&[
                "2", "2", "a", "b", "0", "DEL", "2", "SREM", "1", "k", "SADD", "2", "k", "j",
            ])
        );
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let result = RedisStore::with_url("not-a-url").await;
        assert!(matches!(result, Err(CacheError::Configuration { .. })));
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_put_and_get() {
        let store = connect().await;

        store
            .put("recache-test:key1", Bytes::from_static(b"value1"), Duration::from_secs(60))
            .await
            .unwrap();

        let result = store.get("recache-test:key1").await.unwrap();
        assert_eq!(result, Some(Bytes::from_static(b"value1")));

        // Cleanup
        store.delete(&strings(&["recache-test:key1"])).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_ttl_expiration() {
        let store = connect().await;

        store
            .put("recache-test:ttl", Bytes::from_static(b"v"), Duration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.get("recache-test:ttl").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_set_scan_pages() {
        let store = connect().await;
        let key = "recache-test:set";
        let members: Vec<String> = (0..500).map(|i| format!("m{}", i)).collect();
        store.set_add(key, &members).await.unwrap();

        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0;
        loop {
            let page = store.set_scan(key, cursor, 50).await.unwrap();
            seen.extend(page.members);
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        assert_eq!(seen.len(), 500);

        // Cleanup
        store.delete(&strings(&[key])).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_execute_batch() {
        let store = connect().await;
        store
            .put("recache-test:entry", Bytes::from_static(b"v"), Duration::ZERO)
            .await
            .unwrap();
        store
            .set_add("recache-test:old", &strings(&["k"]))
            .await
            .unwrap();

        let mut batch = StoreBatch::new();
        batch
            .delete(strings(&["recache-test:entry"]))
            .set_remove("recache-test:old", strings(&["k"]))
            .set_add("recache-test:new", strings(&["k"]));
        assert_eq!(store.execute(batch).await.unwrap(), BatchOutcome::Applied);

        assert!(store.get("recache-test:entry").await.unwrap().is_none());
        assert!(store.set_members("recache-test:old").await.unwrap().is_empty());

        let many = store
            .set_members_many(&strings(&["recache-test:new", "recache-test:old"]))
            .await
            .unwrap();
        assert_eq!(many, vec![strings(&["k"]), Vec::<String>::new()]);

        // Cleanup
        store.delete(&strings(&["recache-test:new"])).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_guarded_batch_conflict() {
        let store = connect().await;
        let key = "recache-test:guarded";
        store.set_add(key, &strings(&["a", "b"])).await.unwrap();

        let mut stale = StoreBatch::new();
        stale
            .guard(key, strings(&["a"]))
            .delete(strings(&[key]));
        assert_eq!(store.execute(stale).await.unwrap(), BatchOutcome::Conflict);
        assert_eq!(store.set_members(key).await.unwrap().len(), 2);

        let mut fresh = StoreBatch::new();
        fresh
            .guard(key, strings(&["b", "a"]))
            .delete(strings(&[key]));
        assert_eq!(store.execute(fresh).await.unwrap(), BatchOutcome::Applied);
        assert!(store.set_members(key).await.unwrap().is_empty());
    }
}
