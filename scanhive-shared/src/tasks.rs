/// Task store
///
/// Persistence and state-machine enforcement for [`ScanTask`] records. Every
/// record lives as one JSON blob under `task:<id>`; every mutation is a
/// compare-and-set against the serialized record, which makes each task
/// single-writer without any external locking:
///
/// - `create` is set-if-absent, so ids are unique by construction
/// - `transition` validates the edge and stamps the appropriate timestamp
/// - `update` applies a field patch
///
/// A CAS loss simply reloads and retries; a transition that becomes invalid
/// after a reload (someone else won the race) surfaces as
/// `InvalidTransition`, which is exactly what the worker wants when a task
/// was cancelled under it.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use scanhive_shared::models::{NewScan, ScanTask, ScanType, TaskStatus};
/// use scanhive_shared::store::MemoryStore;
/// use scanhive_shared::tasks::TaskStore;
///
/// # async fn example() -> scanhive_shared::error::CoreResult<()> {
/// let tasks = TaskStore::new(Arc::new(MemoryStore::new()));
/// let task = ScanTask::new("nessus-ab12cd34-20250104T120000000000".into(), NewScan {
///     targets: "10.0.0.1".into(),
///     scan_name: "edge".into(),
///     description: None,
///     scan_type: ScanType::Untrusted,
///     scanner_pool: "nessus".into(),
///     idempotency_key: None,
/// });
/// tasks.create(&task).await?;
/// tasks.transition(&task.id, TaskStatus::Running).await?;
/// # Ok(())
/// # }
/// ```
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult, FailureReason};
use crate::models::{ScanTask, TaskStatus};
use crate::store::KvStore;

/// Bound on CAS retries before reporting contention upward.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Store key for a task record.
pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// Per-task artifact directory under the configured data root.
pub fn artifact_dir(data_dir: &Path, task_id: &str) -> PathBuf {
    data_dir.join(task_id)
}

/// Full artifact path, `<data_dir>/<task_id>/scan_native.<ext>`.
pub fn artifact_file(data_dir: &Path, task_id: &str, ext: &str) -> PathBuf {
    artifact_dir(data_dir, task_id).join(format!("scan_native.{}", ext))
}

/// Field patch for [`TaskStore::update`]
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub progress: Option<u8>,
    pub scanner_instance_key: Option<String>,
    pub remote_scan_id: Option<String>,
    pub vulnerabilities_found: Option<u64>,
    pub failure_reason: Option<FailureReason>,
    pub artifact_path: Option<String>,
}

/// Listing filter for [`TaskStore::list`]
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub pool: Option<String>,
}

/// One page of a task listing
#[derive(Debug, Clone)]
pub struct TaskPage {
    /// Tasks on this page, newest first
    pub tasks: Vec<ScanTask>,

    /// Total matching tasks across all pages
    pub total: usize,

    /// Cursor for the next page, if there is one
    pub next_cursor: Option<String>,
}

/// Task store over a [`KvStore`]
#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn KvStore>,
}

impl TaskStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        TaskStore { store }
    }

    /// Creates a task record. Fails with `Conflict` if the id already
    /// exists (the caller regenerates the id and retries).
    pub async fn create(&self, task: &ScanTask) -> CoreResult<()> {
        let json = serde_json::to_string(task)
            .map_err(|e| CoreError::Internal(format!("serialize task: {}", e)))?;
        let created = self.store.set_nx(&task_key(&task.id), &json, None).await?;
        if !created {
            return Err(CoreError::Conflict(format!(
                "task id {} already exists",
                task.id
            )));
        }
        tracing::debug!(task_id = %task.id, pool = %task.scanner_pool, "Task created");
        Ok(())
    }

    /// Loads a task, failing with `NotFound` if absent.
    pub async fn get(&self, task_id: &str) -> CoreResult<ScanTask> {
        self.try_get(task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("task {} not found", task_id)))
    }

    /// Loads a task if present.
    pub async fn try_get(&self, task_id: &str) -> CoreResult<Option<ScanTask>> {
        match self.load_raw(task_id).await? {
            Some((task, _)) => Ok(Some(task)),
            None => Ok(None),
        }
    }

    /// Applies a field patch atomically.
    pub async fn update(&self, task_id: &str, patch: TaskPatch) -> CoreResult<ScanTask> {
        self.mutate(task_id, |task| {
            apply_patch(task, &patch);
            Ok(())
        })
        .await
    }

    /// Transitions a task to `to`, validating the edge and stamping the
    /// appropriate timestamp.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the task does not exist
    /// - `InvalidTransition` if the edge is not in the allowed set
    pub async fn transition(&self, task_id: &str, to: TaskStatus) -> CoreResult<ScanTask> {
        let task = self
            .mutate(task_id, |task| {
                if !task.status.can_transition_to(to) {
                    return Err(CoreError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        to: to.as_str().to_string(),
                    });
                }
                let now = Utc::now();
                task.status = to;
                match to {
                    TaskStatus::Running => {
                        task.started_at = Some(now);
                        task.last_heartbeat_at = Some(now);
                    }
                    s if s.is_terminal() => {
                        task.completed_at = Some(now);
                    }
                    _ => {}
                }
                Ok(())
            })
            .await?;
        tracing::info!(task_id = %task_id, status = %to, "Task transitioned");
        Ok(task)
    }

    /// Stamps a liveness heartbeat. No-op (returns false) unless the task is
    /// still `running` — a terminal transition under the worker's feet must
    /// not be resurrected by a late heartbeat.
    pub async fn heartbeat(&self, task_id: &str, worker_id: &str) -> CoreResult<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut task, raw)) = self.load_raw(task_id).await? else {
                return Ok(false);
            };
            if task.status != TaskStatus::Running {
                return Ok(false);
            }
            task.last_heartbeat_at = Some(Utc::now());
            task.worker_id = Some(worker_id.to_string());
            let next = serde_json::to_string(&task)
                .map_err(|e| CoreError::Internal(format!("serialize task: {}", e)))?;
            if self
                .store
                .compare_and_swap(&task_key(task_id), &raw, &next)
                .await?
            {
                return Ok(true);
            }
        }
        Err(CoreError::Unavailable(format!(
            "task {} heartbeat contended",
            task_id
        )))
    }

    /// Lists tasks newest-first with cursor pagination on
    /// `(created_at, id)`.
    pub async fn list(
        &self,
        filter: &TaskFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> CoreResult<TaskPage> {
        let limit = limit.max(1);
        let mut tasks = self.load_all().await?;
        tasks.retain(|t| {
            filter.status.map_or(true, |s| t.status == s)
                && filter.pool.as_deref().map_or(true, |p| t.scanner_pool == p)
        });
        let total = tasks.len();

        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        if let Some(cursor) = cursor {
            let (ts, id) = decode_cursor(cursor)?;
            tasks.retain(|t| (t.created_at, t.id.as_str()) < (ts, id.as_str()));
        }

        let next_cursor = if tasks.len() > limit {
            tasks.get(limit - 1).map(|t| encode_cursor(t))
        } else {
            None
        };
        tasks.truncate(limit);

        Ok(TaskPage {
            tasks,
            total,
            next_cursor,
        })
    }

    /// Counts tasks in the given status (optionally per pool).
    pub async fn count(&self, status: TaskStatus, pool: Option<&str>) -> CoreResult<usize> {
        let filter = TaskFilter {
            status: Some(status),
            pool: pool.map(str::to_string),
        };
        Ok(self.list(&filter, usize::MAX, None).await?.total)
    }

    /// Loads every task record. Used by listings and the housekeeping
    /// sweeps; not a hot path.
    pub async fn load_all(&self) -> CoreResult<Vec<ScanTask>> {
        let keys = self.store.keys("task:").await?;
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.store.get(&key).await? {
                match serde_json::from_str::<ScanTask>(&raw) {
                    Ok(task) => tasks.push(task),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping unreadable task record")
                    }
                }
            }
        }
        Ok(tasks)
    }

    /// Removes a task record outright. Only the TTL housekeeper and tests
    /// call this.
    pub async fn remove(&self, task_id: &str) -> CoreResult<bool> {
        Ok(self.store.del(&task_key(task_id)).await?)
    }

    /// Admin escape hatch for DLQ requeue: rewrites a `failed` task back to
    /// a fresh `queued` record, clearing everything a new dispatch will
    /// re-derive. Not part of the normal transition graph.
    pub async fn reset_for_retry(&self, task_id: &str) -> CoreResult<ScanTask> {
        self.mutate(task_id, |task| {
            if task.status != TaskStatus::Failed {
                return Err(CoreError::InvalidTransition {
                    from: task.status.as_str().to_string(),
                    to: TaskStatus::Queued.as_str().to_string(),
                });
            }
            task.status = TaskStatus::Queued;
            task.started_at = None;
            task.completed_at = None;
            task.last_heartbeat_at = None;
            task.worker_id = None;
            task.scanner_instance_key = None;
            task.remote_scan_id = None;
            task.progress = 0;
            task.failure_reason = None;
            Ok(())
        })
        .await
    }

    async fn load_raw(&self, task_id: &str) -> CoreResult<Option<(ScanTask, String)>> {
        let Some(raw) = self.store.get(&task_key(task_id)).await? else {
            return Ok(None);
        };
        let task = serde_json::from_str::<ScanTask>(&raw)
            .map_err(|e| CoreError::Internal(format!("corrupt task record {}: {}", task_id, e)))?;
        Ok(Some((task, raw)))
    }

    /// CAS loop shared by update/transition: load, mutate, swap, retry on
    /// interference.
    async fn mutate<F>(&self, task_id: &str, mutator: F) -> CoreResult<ScanTask>
    where
        F: Fn(&mut ScanTask) -> CoreResult<()>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut task, raw)) = self.load_raw(task_id).await? else {
                return Err(CoreError::NotFound(format!("task {} not found", task_id)));
            };
            mutator(&mut task)?;
            let next = serde_json::to_string(&task)
                .map_err(|e| CoreError::Internal(format!("serialize task: {}", e)))?;
            if self
                .store
                .compare_and_swap(&task_key(task_id), &raw, &next)
                .await?
            {
                return Ok(task);
            }
        }
        Err(CoreError::Unavailable(format!(
            "task {} update contended",
            task_id
        )))
    }
}

fn apply_patch(task: &mut ScanTask, patch: &TaskPatch) {
    if let Some(progress) = patch.progress {
        task.progress = progress.min(100);
    }
    if let Some(key) = &patch.scanner_instance_key {
        task.scanner_instance_key = Some(key.clone());
    }
    if let Some(remote) = &patch.remote_scan_id {
        task.remote_scan_id = Some(remote.clone());
    }
    if let Some(found) = patch.vulnerabilities_found {
        task.vulnerabilities_found = Some(found);
    }
    if let Some(reason) = patch.failure_reason {
        task.failure_reason = Some(reason);
    }
    if let Some(path) = &patch.artifact_path {
        task.artifact_path = Some(path.clone());
    }
}

fn encode_cursor(task: &ScanTask) -> String {
    format!("{}|{}", task.created_at.to_rfc3339(), task.id)
}

fn decode_cursor(cursor: &str) -> CoreResult<(chrono::DateTime<Utc>, String)> {
    let (ts, id) = cursor
        .split_once('|')
        .ok_or_else(|| CoreError::InvalidArgument(format!("malformed cursor: {}", cursor)))?;
    let ts = chrono::DateTime::parse_from_rfc3339(ts)
        .map_err(|e| CoreError::InvalidArgument(format!("malformed cursor timestamp: {}", e)))?
        .with_timezone(&Utc);
    Ok((ts, id.to_string()))
}
