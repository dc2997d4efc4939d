/// Key-value/queue persistence abstraction
///
/// Everything the core persists — task records, pool queues, the DLQ, the
/// idempotency index, and housekeeping counters — goes through the [`KvStore`]
/// trait. The contract is deliberately small: TTL'd keys, set-if-absent,
/// compare-and-set, atomic counters, FIFO lists, and hashes. Two
/// implementations ship with the crate:
///
/// - [`MemoryStore`]: in-process, used by the test suites and for embedding
/// - [`RedisStore`]: production store on `redis::aio::ConnectionManager`
///
/// # Atomicity
///
/// Each trait method is atomic with respect to its key. Higher layers build
/// their invariants on exactly three primitives:
///
/// - `set_nx` — idempotency claims and task-record creation
/// - `compare_and_swap` — single-writer task state transitions
/// - `rpush`/`lpop` — FIFO queue push/pop
///
/// # Example
///
/// ```
/// use scanhive_shared::store::{KvStore, MemoryStore};
///
/// # async fn example() -> Result<(), scanhive_shared::store::StoreError> {
/// let store = MemoryStore::new();
/// store.rpush("queue:nessus", "task-1").await?;
/// store.rpush("queue:nessus", "task-2").await?;
/// assert_eq!(store.lpop("queue:nessus").await?, Some("task-1".to_string()));
/// # Ok(())
/// # }
/// ```
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use crate::error::CoreError;

/// Persistence layer error
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or timed out (retryable)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be interpreted
    #[error("corrupt store entry at {key}: {detail}")]
    Corrupt { key: String, detail: String },

    /// Anything else
    #[error("store error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => CoreError::Unavailable(msg),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

/// Key-value/queue store contract
///
/// Implementations must be cheap to clone behind `Arc` and safe to share
/// across worker tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    // -- plain keys -------------------------------------------------------

    /// Gets the value at `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Sets `key` to `value` with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Sets `key` to `value` with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Sets `key` to `value` only if the key does not exist.
    ///
    /// Returns true if the write happened. The TTL, when given, applies only
    /// on a successful write.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Atomically replaces the value at `key` only if it currently equals
    /// `expected`. Returns true if the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Deletes `key`. Returns true if it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increments the integer at `key` by `by`, creating it at 0.
    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError>;

    /// Lists keys with the given prefix. Intended for low-frequency sweeps
    /// (listing, housekeeping), not hot paths.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    // -- lists (FIFO via rpush/lpop) --------------------------------------

    /// Appends to the tail of the list. Returns the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Pops the head of the list, if any.
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Reads the element at `index` without removing it.
    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, StoreError>;

    /// Length of the list (0 for a missing key).
    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    /// Removes all elements equal to `value`. Returns the number removed.
    async fn lrem(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Reads the whole list.
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError>;

    // -- hashes -----------------------------------------------------------

    /// Sets a hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Gets a hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Reads all fields of a hash, in unspecified order.
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Deletes a hash field. Returns true if it existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Contract tests run against MemoryStore; RedisStore runs the same set
    // behind #[ignore] in redis_store.rs.

    #[tokio::test]
    async fn test_set_get_del() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_claims_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx("idem:key", "task-1", None).await.unwrap());
        assert!(!store.set_nx("idem:key", "task-2", None).await.unwrap());
        assert_eq!(store.get("idem:key").await.unwrap(), Some("task-1".to_string()));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        store.set("k", "a").await.unwrap();
        assert!(store.compare_and_swap("k", "a", "b").await.unwrap());
        assert!(!store.compare_and_swap("k", "a", "c").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("b".to_string()));
        // CAS against a missing key never succeeds
        assert!(!store.compare_and_swap("missing", "a", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n", 1).await.unwrap(), 1);
        assert_eq!(store.incr("n", 2).await.unwrap(), 3);
        assert_eq!(store.incr("n", -3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.rpush("q", &format!("t{}", i)).await.unwrap();
        }
        assert_eq!(store.llen("q").await.unwrap(), 5);
        assert_eq!(store.lindex("q", 0).await.unwrap(), Some("t0".to_string()));
        for i in 0..5 {
            assert_eq!(store.lpop("q").await.unwrap(), Some(format!("t{}", i)));
        }
        assert_eq!(store.lpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lrem() {
        let store = MemoryStore::new();
        store.rpush("q", "a").await.unwrap();
        store.rpush("q", "b").await.unwrap();
        store.rpush("q", "a").await.unwrap();
        assert_eq!(store.lrem("q", "a").await.unwrap(), 2);
        assert_eq!(store.lrange_all("q").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_hashes() {
        let store = MemoryStore::new();
        store.hset("h", "f1", "v1").await.unwrap();
        store.hset("h", "f2", "v2").await.unwrap();
        assert_eq!(store.hget("h", "f1").await.unwrap(), Some("v1".to_string()));
        let mut all = store.hgetall("h").await.unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("f1".to_string(), "v1".to_string()),
                ("f2".to_string(), "v2".to_string())
            ]
        );
        assert!(store.hdel("h", "f1").await.unwrap());
        assert!(!store.hdel("h", "f1").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_prefix() {
        let store = MemoryStore::new();
        store.set("task:a", "1").await.unwrap();
        store.set("task:b", "2").await.unwrap();
        store.set("idem:a", "3").await.unwrap();
        let mut keys = store.keys("task:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["task:a".to_string(), "task:b".to_string()]);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // expired keys are claimable again
        assert!(store.set_nx("k", "w", None).await.unwrap());
    }
}
