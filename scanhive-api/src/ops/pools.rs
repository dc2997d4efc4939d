/// Pool, queue, and DLQ administration
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use scanhive_shared::error::CoreResult;
use scanhive_shared::models::TaskStatus;
use scanhive_shared::queue::DlqEntry;
use scanhive_shared::registry::{InstanceStatus, PoolStatus};

use super::ScanService;

/// `list_scanners` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListScannersResponse {
    pub scanners: Vec<InstanceStatus>,
}

/// `list_pools` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPoolsResponse {
    pub pools: Vec<String>,
    pub default_pool: String,
}

/// Per-pool slice of `get_queue_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolQueueDetail {
    pub depth: u64,
    pub dlq_size: u64,

    /// Tasks currently running against this pool (dispatch lag indicator)
    pub running: usize,
}

/// `get_queue_status` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatusResponse {
    /// Aggregate depth across pools
    pub queue_depth: u64,

    /// Aggregate DLQ size across pools
    pub dlq_size: u64,

    pub per_pool: BTreeMap<String, PoolQueueDetail>,
}

/// `dlq_clear` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqClearResponse {
    pub pool: String,
    pub cleared: u64,
}

/// `dlq_requeue` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRequeueResponse {
    pub task_id: String,
    pub status: String,
}

impl ScanService {
    /// Every configured scanner instance with its live load.
    pub fn list_scanners(&self) -> ListScannersResponse {
        ListScannersResponse {
            scanners: self.registry.list_instances(),
        }
    }

    /// Known pools and the submission default.
    pub fn list_pools(&self) -> ListPoolsResponse {
        ListPoolsResponse {
            pools: self.registry.list_pools(),
            default_pool: self.config.default_pool.clone(),
        }
    }

    /// Capacity summary for one pool (the default pool when none is named).
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown pool.
    pub fn get_pool_status(&self, pool: Option<&str>) -> CoreResult<PoolStatus> {
        let pool = pool.unwrap_or(&self.config.default_pool);
        self.registry.pool_status(pool)
    }

    /// Queue and DLQ depths, per pool and aggregate.
    pub async fn get_queue_status(&self) -> CoreResult<QueueStatusResponse> {
        let stats = self.queue.stats().await?;
        let mut per_pool = BTreeMap::new();
        for (pool, counters) in &stats.per_pool {
            let running = self.tasks.count(TaskStatus::Running, Some(pool)).await?;
            per_pool.insert(
                pool.clone(),
                PoolQueueDetail {
                    depth: counters.depth,
                    dlq_size: counters.dlq_size,
                    running,
                },
            );
        }
        Ok(QueueStatusResponse {
            queue_depth: stats.total_depth,
            dlq_size: stats.total_dlq,
            per_pool,
        })
    }

    /// Full DLQ contents for one pool.
    pub async fn dlq_entries(&self, pool: &str) -> CoreResult<Vec<DlqEntry>> {
        self.queue.dlq_entries(pool).await
    }

    /// Empties a pool's DLQ. Clearing an empty DLQ succeeds silently.
    pub async fn dlq_clear(&self, pool: &str) -> CoreResult<DlqClearResponse> {
        let cleared = self.queue.clear_dlq(pool).await?;
        tracing::info!(pool = %pool, cleared, "DLQ cleared");
        Ok(DlqClearResponse {
            pool: pool.to_string(),
            cleared,
        })
    }

    /// Puts a dead-lettered task back on its pool: the DLQ entry is
    /// removed, the failed record is reset to `queued`, and the id is
    /// re-enqueued at the tail.
    ///
    /// # Errors
    ///
    /// `NotFound` if the task has no DLQ entry on that pool.
    pub async fn dlq_requeue(&self, pool: &str, task_id: &str) -> CoreResult<DlqRequeueResponse> {
        let entry = self.queue.take_from_dlq(pool, task_id).await?;
        let task = self.tasks.reset_for_retry(task_id).await?;
        self.queue.requeue(pool, task_id).await?;
        tracing::info!(
            task_id = %task_id,
            pool = %pool,
            previous_attempts = entry.attempts,
            "Task requeued from DLQ"
        );
        Ok(DlqRequeueResponse {
            task_id: task.id,
            status: task.status.as_str().to_string(),
        })
    }
}
