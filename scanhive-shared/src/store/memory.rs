/// In-process store implementation
///
/// Backs the test suites and single-process embeddings. All state lives in a
/// single mutex-held map; TTLs are enforced lazily at read time.
use super::{KvStore, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |t| Instant::now() < t)
    }
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// In-memory [`KvStore`]
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-mutation; the store contents are
        // still structurally valid strings, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        match inner.kv.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.lock().kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.kv.get(key).is_some_and(|e| e.live()) {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.kv.get_mut(key) {
            Some(entry) if entry.live() && entry.value == expected => {
                entry.value = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let existed = inner.kv.remove(key).is_some_and(|e| e.live());
        Ok(existed)
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let current = match inner.kv.get(key) {
            Some(entry) if entry.live() => {
                entry.value.parse::<i64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    detail: format!("not an integer: {}", e),
                })?
            }
            _ => 0,
        };
        let next = current + by;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .kv
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_front()))
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, StoreError> {
        let inner = self.lock();
        let Some(list) = inner.lists.get(key) else {
            return Ok(None);
        };
        let idx = if index < 0 {
            let back = (-index) as usize;
            if back > list.len() {
                return Ok(None);
            }
            list.len() - back
        } else {
            index as usize
        };
        Ok(list.get(idx).cloned())
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let inner = self.lock();
        Ok(inner.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok((before - list.len()) as u64)
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock();
        Ok(inner.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        Ok(inner
            .hashes
            .get_mut(key)
            .map_or(false, |h| h.remove(field).is_some()))
    }
}
