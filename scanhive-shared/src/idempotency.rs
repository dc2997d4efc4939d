/// Idempotency index
///
/// Maps a client-supplied key to a task id for a bounded window, so retried
/// submissions collapse onto the task the first attempt created. The claim
/// is one set-if-absent, which is what makes the concurrency guarantee hold:
/// two racing claims with the same key both come back with the id the winner
/// bound.
///
/// Keys live under `idem:<key>` with a TTL (default 24 h).
use std::sync::Arc;
use std::time::Duration;

use crate::error::CoreResult;
use crate::store::KvStore;

fn idem_key(key: &str) -> String {
    format!("idem:{}", key)
}

/// Outcome of a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// The task id now bound to the key — the caller's own id if the claim
    /// was fresh, the previously bound one otherwise.
    pub task_id: String,

    /// True if this call created the binding.
    pub was_new: bool,
}

/// TTL'd key → task-id index over a [`KvStore`]
#[derive(Clone)]
pub struct IdempotencyIndex {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl IdempotencyIndex {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        IdempotencyIndex { store, ttl }
    }

    /// Claims `key` for `task_id`.
    ///
    /// If the key is free the binding is created with the configured TTL and
    /// `was_new` is true; if the key is taken, the existing task id comes
    /// back and the caller must NOT create a new task.
    pub async fn claim(&self, key: &str, task_id: &str) -> CoreResult<Claim> {
        let store_key = idem_key(key);
        if self
            .store
            .set_nx(&store_key, task_id, Some(self.ttl))
            .await?
        {
            return Ok(Claim {
                task_id: task_id.to_string(),
                was_new: true,
            });
        }

        match self.store.get(&store_key).await? {
            Some(existing) => Ok(Claim {
                task_id: existing,
                was_new: false,
            }),
            // The binding expired between our set_nx and get; take it now.
            None => {
                self.store
                    .set_ex(&store_key, task_id, self.ttl)
                    .await?;
                Ok(Claim {
                    task_id: task_id.to_string(),
                    was_new: true,
                })
            }
        }
    }

    /// Looks up the task id bound to `key`, if any.
    pub async fn lookup(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.store.get(&idem_key(key)).await?)
    }

    /// Drops a binding. Used when task creation fails after a fresh claim,
    /// so the client's retry is not pinned to a task that never existed.
    pub async fn release(&self, key: &str) -> CoreResult<bool> {
        Ok(self.store.del(&idem_key(key)).await?)
    }
}
