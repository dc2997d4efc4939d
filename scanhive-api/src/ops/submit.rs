/// Scan submission
///
/// `submit_scan` is the only write path into the system: it claims the
/// idempotency key (when given), creates the task record, and enqueues the
/// task id on its pool. The claim happens before the create, so two racing
/// submissions with the same key agree on one task id and at most one task
/// record ever exists.
///
/// # Example Request
///
/// ```json
/// {
///   "targets": "192.168.1.0/24",
///   "scan_name": "perimeter sweep",
///   "scan_type": "untrusted",
///   "scanner_pool": "dmz",
///   "idempotency_key": "sweep-2025-01-04"
/// }
/// ```
///
/// # Example Response
///
/// ```json
/// {
///   "task_id": "dmz-4fa9c1d2-20250104T120000123456",
///   "status": "queued",
///   "idempotent": false
/// }
/// ```
use serde::{Deserialize, Serialize};

use scanhive_shared::error::{CoreError, CoreResult};
use scanhive_shared::models::{generate_task_id, NewScan, ScanTask, ScanType, TaskStatus};

use super::ScanService;

/// Submit request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitScanRequest {
    /// Scan targets; must be non-empty
    pub targets: String,

    /// Display name; must be non-empty
    pub scan_name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// `untrusted` or `authenticated`
    pub scan_type: String,

    /// Pool to queue on; the configured default pool when omitted
    #[serde(default)]
    pub scanner_pool: Option<String>,

    /// Collapses retried submissions within the idempotency window
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Submit response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitScanResponse {
    pub task_id: String,

    /// Task status at response time
    pub status: String,

    /// True when an existing task was returned instead of a new one
    pub idempotent: bool,
}

impl ScanService {
    /// Submits a scan, or returns the task a previous submission with the
    /// same idempotency key created.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: empty targets/name, unknown scan type or pool
    /// - `QueueFull` (retryable): the pool is at its high-water mark
    pub async fn submit_scan(&self, req: SubmitScanRequest) -> CoreResult<SubmitScanResponse> {
        if req.targets.trim().is_empty() {
            return Err(CoreError::InvalidArgument("targets must not be empty".into()));
        }
        if req.scan_name.trim().is_empty() {
            return Err(CoreError::InvalidArgument("scan_name must not be empty".into()));
        }
        let scan_type = ScanType::parse(&req.scan_type).ok_or_else(|| {
            CoreError::InvalidArgument(format!("unknown scan_type: {}", req.scan_type))
        })?;

        let pool = req
            .scanner_pool
            .clone()
            .unwrap_or_else(|| self.config.default_pool.clone());
        if !self.registry.list_pools().contains(&pool) {
            return Err(CoreError::InvalidArgument(format!(
                "unknown scanner pool: {}",
                pool
            )));
        }

        // Backpressure before any state is written.
        let depth = self.queue.depth(&pool).await?;
        if depth >= self.config.max_queue_depth {
            return Err(CoreError::QueueFull {
                pool,
                depth,
                limit: self.config.max_queue_depth,
            });
        }

        let scan = NewScan {
            targets: req.targets,
            scan_name: req.scan_name,
            description: req.description,
            scan_type,
            scanner_pool: pool.clone(),
            idempotency_key: req.idempotency_key.clone(),
        };

        match &req.idempotency_key {
            Some(key) => self.submit_idempotent(key, &pool, scan).await,
            None => {
                let task_id = self.create_task(scan).await?;
                self.enqueue_new(&pool, &task_id, None).await?;
                Ok(SubmitScanResponse {
                    task_id,
                    status: TaskStatus::Queued.as_str().to_string(),
                    idempotent: false,
                })
            }
        }
    }

    async fn submit_idempotent(
        &self,
        key: &str,
        pool: &str,
        scan: NewScan,
    ) -> CoreResult<SubmitScanResponse> {
        // Two passes: if the bound task vanished (expired and removed), the
        // stale binding is dropped and reclaimed once.
        for _ in 0..2 {
            let candidate = generate_task_id(pool, &self.instance_tag);
            let claim = self.idempotency.claim(key, &candidate).await?;

            if claim.was_new {
                let task = ScanTask::new(claim.task_id.clone(), scan.clone());
                if let Err(e) = self.tasks.create(&task).await {
                    // Keep the client's retry path open.
                    self.idempotency.release(key).await?;
                    return Err(e);
                }
                self.enqueue_new(pool, &claim.task_id, Some(key)).await?;
                return Ok(SubmitScanResponse {
                    task_id: claim.task_id,
                    status: TaskStatus::Queued.as_str().to_string(),
                    idempotent: false,
                });
            }

            // The winning submission may still be writing the record; give
            // it a grace window before treating the binding as stale.
            for _ in 0..20 {
                if let Some(existing) = self.tasks.try_get(&claim.task_id).await? {
                    if existing.targets != scan.targets
                        || existing.scan_type != scan.scan_type
                        || existing.scanner_pool != scan.scanner_pool
                    {
                        return Err(CoreError::Conflict(format!(
                            "idempotency key {} is bound to task {} with a different payload",
                            key, existing.id
                        )));
                    }
                    tracing::debug!(
                        task_id = %existing.id,
                        idempotency_key = %key,
                        "Submission collapsed onto existing task"
                    );
                    return Ok(SubmitScanResponse {
                        task_id: existing.id,
                        status: existing.status.as_str().to_string(),
                        idempotent: true,
                    });
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            tracing::warn!(
                idempotency_key = %key,
                task_id = %claim.task_id,
                "Idempotency key bound to a missing task, rebinding"
            );
            self.idempotency.release(key).await?;
        }
        Err(CoreError::Unavailable(format!(
            "idempotency key {} is contended",
            key
        )))
    }

    /// Creates the record, regenerating the id on the rare same-microsecond
    /// collision.
    async fn create_task(&self, scan: NewScan) -> CoreResult<String> {
        for _ in 0..8 {
            let task_id = generate_task_id(&scan.scanner_pool, &self.instance_tag);
            let task = ScanTask::new(task_id.clone(), scan.clone());
            match self.tasks.create(&task).await {
                Ok(()) => return Ok(task_id),
                Err(CoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Internal("could not allocate a task id".into()))
    }

    /// Enqueues a freshly created task; on failure the record is cancelled
    /// so it cannot dangle in `queued` without ever being queued.
    async fn enqueue_new(
        &self,
        pool: &str,
        task_id: &str,
        idempotency_key: Option<&str>,
    ) -> CoreResult<()> {
        match self.queue.enqueue(pool, task_id).await {
            Ok(()) => {
                tracing::info!(task_id = %task_id, pool = %pool, "Scan submitted");
                Ok(())
            }
            Err(e) => {
                let _ = self.tasks.transition(task_id, TaskStatus::Cancelled).await;
                if let Some(key) = idempotency_key {
                    let _ = self.idempotency.release(key).await;
                }
                Err(e)
            }
        }
    }
}
