/// Multi-pool scan queue with a per-pool dead-letter queue
///
/// One FIFO list per pool (`queue:<pool>`), one DLQ list per pool
/// (`dlq:<pool>`). Queue items are bare task ids — the record of truth lives
/// in the task store. Atomic list push/pop gives the delivery guarantee:
/// with any number of consumers, each item is popped by exactly one.
///
/// # Fairness
///
/// `dequeue_any` scans the caller's pools in round-robin order, not lexical
/// order, so a busy first pool cannot starve the rest. The rotation cursor
/// is per-queue-handle, which is per-worker — exactly the fairness the
/// dispatch loop needs.
///
/// # Backpressure
///
/// `enqueue` rejects with `QueueFull` once a pool's depth reaches the
/// configured high-water mark. Re-enqueues from the dispatch path use
/// `requeue`, which skips the check — a task that was already admitted must
/// not be dropped because the pool filled up behind it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::{CoreError, CoreResult};
use crate::store::KvStore;

/// How often a bounded dequeue wait re-polls the lists.
const DEQUEUE_POLL_STEP: Duration = Duration::from_millis(25);

/// Hash tracking every pool that has ever seen traffic, for stats.
const POOLS_KEY: &str = "pools";

fn queue_key(pool: &str) -> String {
    format!("queue:{}", pool)
}

fn dlq_key(pool: &str) -> String {
    format!("dlq:{}", pool)
}

/// Dead-letter queue entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Task that failed terminally
    pub task_id: String,

    /// Pool the task was originally queued on
    pub pool: String,

    /// Failure reason, recorded verbatim
    pub reason: String,

    /// First time this task hit the DLQ
    pub first_failed_at: DateTime<Utc>,

    /// How many times it has landed here
    pub attempts: u32,
}

/// Per-pool queue counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolQueueStats {
    pub depth: u64,
    pub dlq_size: u64,
}

/// Aggregate queue statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Stats per pool, in pool-name order
    pub per_pool: BTreeMap<String, PoolQueueStats>,

    /// Sum of all pool depths
    pub total_depth: u64,

    /// Sum of all DLQ sizes
    pub total_dlq: u64,
}

/// Multi-pool FIFO queue over a [`KvStore`]
#[derive(Clone)]
pub struct ScanQueue {
    store: Arc<dyn KvStore>,
    max_depth: u64,
    rotation: Arc<AtomicUsize>,
}

impl ScanQueue {
    pub fn new(store: Arc<dyn KvStore>, max_depth: u64) -> Self {
        ScanQueue {
            store,
            max_depth,
            rotation: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueues a task id on a pool.
    ///
    /// # Errors
    ///
    /// `QueueFull` (retryable) once the pool is at the high-water mark.
    pub async fn enqueue(&self, pool: &str, task_id: &str) -> CoreResult<()> {
        let depth = self.depth(pool).await?;
        if depth >= self.max_depth {
            return Err(CoreError::QueueFull {
                pool: pool.to_string(),
                depth,
                limit: self.max_depth,
            });
        }
        self.push(pool, task_id).await
    }

    /// Puts a previously admitted task back on the tail of its pool,
    /// bypassing the high-water check.
    pub async fn requeue(&self, pool: &str, task_id: &str) -> CoreResult<()> {
        self.push(pool, task_id).await
    }

    async fn push(&self, pool: &str, task_id: &str) -> CoreResult<()> {
        self.store.rpush(&queue_key(pool), task_id).await?;
        self.store.hset(POOLS_KEY, pool, "1").await?;
        tracing::debug!(pool = %pool, task_id = %task_id, "Enqueued task");
        Ok(())
    }

    /// Pops the head of one pool, if any.
    pub async fn dequeue(&self, pool: &str) -> CoreResult<Option<String>> {
        Ok(self.store.lpop(&queue_key(pool)).await?)
    }

    /// Pops from any of the given pools, waiting up to `timeout`.
    ///
    /// Pools are scanned starting one past where the previous call landed,
    /// so over time every pool gets first shot equally often. Returns the
    /// pool and task id, or None when the wait expires with no work — the
    /// caller treats that as "idle", not an error.
    pub async fn dequeue_any(
        &self,
        pools: &[String],
        timeout: Duration,
    ) -> CoreResult<Option<(String, String)>> {
        if pools.is_empty() {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let start = self.rotation.fetch_add(1, Ordering::Relaxed);
            for offset in 0..pools.len() {
                let pool = &pools[(start + offset) % pools.len()];
                if let Some(task_id) = self.dequeue(pool).await? {
                    return Ok(Some((pool.clone(), task_id)));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(DEQUEUE_POLL_STEP.min(deadline - now)).await;
        }
    }

    /// Reads the head of a pool without removing it.
    pub async fn peek(&self, pool: &str) -> CoreResult<Option<String>> {
        Ok(self.store.lindex(&queue_key(pool), 0).await?)
    }

    /// Current depth of a pool.
    pub async fn depth(&self, pool: &str) -> CoreResult<u64> {
        Ok(self.store.llen(&queue_key(pool)).await?)
    }

    /// Per-pool and aggregate counters for every pool that has seen traffic.
    pub async fn stats(&self) -> CoreResult<QueueStats> {
        let mut per_pool = BTreeMap::new();
        let mut total_depth = 0;
        let mut total_dlq = 0;
        for (pool, _) in self.store.hgetall(POOLS_KEY).await? {
            let depth = self.depth(&pool).await?;
            let dlq_size = self.dlq_size(&pool).await?;
            total_depth += depth;
            total_dlq += dlq_size;
            per_pool.insert(pool, PoolQueueStats { depth, dlq_size });
        }
        Ok(QueueStats {
            per_pool,
            total_depth,
            total_dlq,
        })
    }

    // -- dead-letter queue ------------------------------------------------

    /// Parks a task id on the pool's DLQ. If the task is already parked,
    /// the entry's attempt count is bumped and its first-failure time kept.
    pub async fn to_dlq(&self, pool: &str, task_id: &str, reason: &str) -> CoreResult<()> {
        let key = dlq_key(pool);
        let mut entry = DlqEntry {
            task_id: task_id.to_string(),
            pool: pool.to_string(),
            reason: reason.to_string(),
            first_failed_at: Utc::now(),
            attempts: 1,
        };

        for raw in self.store.lrange_all(&key).await? {
            if let Ok(existing) = serde_json::from_str::<DlqEntry>(&raw) {
                if existing.task_id == task_id {
                    entry.first_failed_at = existing.first_failed_at;
                    entry.attempts = existing.attempts + 1;
                    self.store.lrem(&key, &raw).await?;
                    break;
                }
            }
        }

        let json = serde_json::to_string(&entry)
            .map_err(|e| CoreError::Internal(format!("serialize DLQ entry: {}", e)))?;
        self.store.rpush(&key, &json).await?;
        self.store.hset(POOLS_KEY, pool, "1").await?;
        tracing::warn!(
            pool = %pool,
            task_id = %task_id,
            reason = %reason,
            attempts = entry.attempts,
            "Task moved to DLQ"
        );
        Ok(())
    }

    /// Number of entries parked on a pool's DLQ.
    pub async fn dlq_size(&self, pool: &str) -> CoreResult<u64> {
        Ok(self.store.llen(&dlq_key(pool)).await?)
    }

    /// Full DLQ contents for a pool, oldest first.
    pub async fn dlq_entries(&self, pool: &str) -> CoreResult<Vec<DlqEntry>> {
        let mut entries = Vec::new();
        for raw in self.store.lrange_all(&dlq_key(pool)).await? {
            match serde_json::from_str::<DlqEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(pool = %pool, error = %e, "Skipping unreadable DLQ entry"),
            }
        }
        Ok(entries)
    }

    /// Empties a pool's DLQ. Clearing an empty DLQ succeeds silently.
    pub async fn clear_dlq(&self, pool: &str) -> CoreResult<u64> {
        let cleared = self.dlq_size(pool).await?;
        self.store.del(&dlq_key(pool)).await?;
        Ok(cleared)
    }

    /// Removes one task's DLQ entry and returns it, or `NotFound`.
    pub async fn take_from_dlq(&self, pool: &str, task_id: &str) -> CoreResult<DlqEntry> {
        let key = dlq_key(pool);
        for raw in self.store.lrange_all(&key).await? {
            if let Ok(entry) = serde_json::from_str::<DlqEntry>(&raw) {
                if entry.task_id == task_id {
                    self.store.lrem(&key, &raw).await?;
                    return Ok(entry);
                }
            }
        }
        Err(CoreError::NotFound(format!(
            "task {} not in DLQ for pool {}",
            task_id, pool
        )))
    }
}
