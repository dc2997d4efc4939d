/// Scan dispatch loop
///
/// Pulls task ids off the pool queues and drives each scan end to end:
///
/// 1. Dequeue from the configured pools (round-robin, bounded wait)
/// 2. Drop anything no longer `queued` (duplicate or cancelled in queue)
/// 3. Reserve a scanner instance; re-enqueue and back off if the pool is
///    saturated
/// 4. Transition `queued → running` and bind the instance
/// 5. create → launch → poll → export, with transient retries, poll-tick
///    cancellation checks, and the per-scan wall-clock bound
/// 6. Persist the artifact atomically (write-temp-then-rename) and count
///    findings opportunistically
/// 7. Transition to the terminal state; unrecoverable failures also land on
///    the pool's DLQ
///
/// The instance reservation is released on every exit path. A worker owns a
/// task exclusively from dequeue to terminal transition; multiple dispatcher
/// instances can run against the same store.
///
/// # Shutdown
///
/// `shutdown_token()` requests a drain: the loop stops dequeuing, finishes
/// the scan it is driving, then closes every cached scanner connection.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use scanhive_shared::config::Config;
use scanhive_shared::error::{CoreError, CoreResult, FailureReason};
use scanhive_shared::models::{ScanTask, TaskStatus};
use scanhive_shared::queue::ScanQueue;
use scanhive_shared::registry::ScannerRegistry;
use scanhive_shared::report::parse_report;
use scanhive_shared::tasks::{artifact_dir, artifact_file, TaskPatch, TaskStore};

use crate::retry::{jitter, RetryPolicy};
use crate::scanner::{RemoteStatus, ScanJob, Scanner, ScannerConnector, ScannerError};

/// Worker-side configuration slice
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pools this dispatcher consumes, in rotation
    pub worker_pools: Vec<String>,

    /// Scanner status poll interval
    pub poll_interval: Duration,

    /// Per-scan wall clock bound, measured from `queued → running`
    pub scan_timeout: Duration,

    /// Bounded dequeue wait per loop iteration
    pub dequeue_timeout: Duration,

    /// Artifact root
    pub data_dir: PathBuf,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        WorkerConfig {
            worker_pools: config.worker_pools.clone(),
            poll_interval: config.poll_interval(),
            scan_timeout: config.scan_timeout(),
            dequeue_timeout: config.dequeue_timeout(),
            data_dir: config.data_dir.clone(),
        }
    }
}

/// How one driven scan ended
enum ScanOutcome {
    Completed {
        artifact_path: PathBuf,
        vulnerabilities: Option<u64>,
    },
    Failed {
        reason: FailureReason,
        detail: String,
    },
    /// Caller already moved the task to `cancelled`; we stopped the remote
    /// scan and walked away.
    CancelledByCaller,
    /// Backend reported stopped/canceled on its own.
    RemoteCancelled,
}

/// The dispatch loop
pub struct ScanDispatcher {
    tasks: TaskStore,
    queue: ScanQueue,
    registry: Arc<ScannerRegistry>,
    connector: Arc<dyn ScannerConnector>,
    connections: tokio::sync::Mutex<HashMap<String, Arc<dyn Scanner>>>,
    retry: RetryPolicy,
    config: WorkerConfig,
    worker_id: String,
    shutdown: CancellationToken,
}

impl ScanDispatcher {
    pub fn new(
        tasks: TaskStore,
        queue: ScanQueue,
        registry: Arc<ScannerRegistry>,
        connector: Arc<dyn ScannerConnector>,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        ScanDispatcher {
            tasks,
            queue,
            registry,
            connector,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
            config,
            worker_id,
            shutdown: CancellationToken::new(),
        }
    }

    /// Overrides the transient-retry policy (tests use a fast one).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Token used to request a drain-and-stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the dispatch loop until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            worker_id = %self.worker_id,
            pools = ?self.config.worker_pools,
            "Dispatcher starting"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let dequeued = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self
                    .queue
                    .dequeue_any(&self.config.worker_pools, self.config.dequeue_timeout) => result,
            };
            let (pool, task_id) = match dequeued {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, error = %e, "Dequeue failed");
                    sleep(jitter(self.retry.base)).await;
                    continue;
                }
            };

            if let Err(e) = self.process(&pool, &task_id).await {
                tracing::error!(
                    worker_id = %self.worker_id,
                    task_id = %task_id,
                    error = %e,
                    "Dispatch failed"
                );
            }
        }

        self.close_connections().await;
        tracing::info!(worker_id = %self.worker_id, "Dispatcher shut down");
        Ok(())
    }

    /// Handles one dequeued task id.
    async fn process(&self, pool: &str, task_id: &str) -> CoreResult<()> {
        let Some(task) = self.tasks.try_get(task_id).await? else {
            tracing::warn!(task_id = %task_id, "Dequeued unknown task");
            return Ok(());
        };
        if task.status != TaskStatus::Queued {
            tracing::debug!(
                task_id = %task_id,
                status = %task.status,
                "Dropping task no longer queued"
            );
            return Ok(());
        }

        let Some(instance_key) = self.registry.reserve(pool) else {
            // No capacity: back of the line, jittered breather.
            self.queue.requeue(pool, task_id).await?;
            sleep(jitter(self.retry.base)).await;
            return Ok(());
        };

        // Claim ownership. Losing this CAS means the task was cancelled
        // between the status check and now.
        let claimed = match self.tasks.transition(task_id, TaskStatus::Running).await {
            Ok(task) => task,
            Err(CoreError::InvalidTransition { .. }) => {
                self.registry.release(&instance_key);
                return Ok(());
            }
            Err(e) => {
                self.registry.release(&instance_key);
                return Err(e);
            }
        };
        let bind = self
            .tasks
            .update(
                task_id,
                TaskPatch {
                    scanner_instance_key: Some(instance_key.clone()),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = bind {
            self.registry.release(&instance_key);
            return Err(e);
        }

        let outcome = self.drive(&claimed, &instance_key).await;
        self.registry.release(&instance_key);
        self.finish(task_id, pool, outcome).await
    }

    /// Drives the remote lifecycle for one claimed task.
    async fn drive(&self, task: &ScanTask, instance_key: &str) -> ScanOutcome {
        let Some(descriptor) = self.registry.descriptor(instance_key) else {
            return ScanOutcome::Failed {
                reason: FailureReason::InternalError,
                detail: format!("instance {} vanished from registry", instance_key),
            };
        };

        let scanner = match self.connection(&descriptor).await {
            Ok(scanner) => scanner,
            Err(e) => return failure_outcome(e, FailureReason::ScannerUnreachable),
        };

        let job = ScanJob {
            task_id: task.id.clone(),
            targets: task.targets.clone(),
            scan_name: task.scan_name.clone(),
            description: task.description.clone(),
            scan_type: task.scan_type,
        };

        let remote_id = match self.create_and_launch(scanner.as_ref(), &job).await {
            Ok(remote_id) => remote_id,
            Err(outcome) => return outcome,
        };
        if let Err(e) = self
            .tasks
            .update(
                &task.id,
                TaskPatch {
                    remote_scan_id: Some(remote_id.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "Could not bind remote scan id");
        }

        let deadline = Instant::now() + self.config.scan_timeout;
        loop {
            sleep(self.config.poll_interval).await;

            // Cancellation check on every poll tick.
            match self.tasks.try_get(&task.id).await {
                Ok(Some(current)) if current.status == TaskStatus::Cancelled => {
                    tracing::info!(
                        task_id = %task.id,
                        reason = %FailureReason::CancelledByUser,
                        "Cancellation observed, stopping remote scan"
                    );
                    if let Err(e) = scanner.stop_scan(&remote_id).await {
                        tracing::warn!(task_id = %task.id, error = %e, "stop_scan failed");
                    }
                    return ScanOutcome::CancelledByCaller;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Cancellation check failed");
                }
            }

            if Instant::now() >= deadline {
                if let Err(e) = scanner.stop_scan(&remote_id).await {
                    tracing::warn!(task_id = %task.id, error = %e, "stop_scan after timeout failed");
                }
                return ScanOutcome::Failed {
                    reason: FailureReason::Timeout,
                    detail: format!(
                        "scan exceeded wall clock bound of {}s",
                        self.config.scan_timeout.as_secs()
                    ),
                };
            }

            let status = match self.poll_status(scanner.as_ref(), &remote_id).await {
                Ok(status) => status,
                Err(outcome) => return outcome,
            };

            if let Err(e) = self
                .tasks
                .update(
                    &task.id,
                    TaskPatch {
                        progress: Some(status.progress),
                        ..Default::default()
                    },
                )
                .await
            {
                tracing::warn!(task_id = %task.id, error = %e, "Progress update failed");
            }
            if let Err(e) = self.tasks.heartbeat(&task.id, &self.worker_id).await {
                tracing::warn!(task_id = %task.id, error = %e, "Heartbeat failed");
            }

            match status.state.normalized() {
                TaskStatus::Completed => break,
                TaskStatus::Failed => {
                    return ScanOutcome::Failed {
                        reason: FailureReason::InternalError,
                        detail: format!("scan aborted on scanner ({:?})", status.state),
                    }
                }
                TaskStatus::Cancelled => return ScanOutcome::RemoteCancelled,
                // queued (pending/paused) or running: keep polling
                _ => {}
            }
        }

        self.export_and_persist(task, scanner.as_ref(), &remote_id)
            .await
    }

    /// create → launch, rolling an orphaned create back with delete_scan
    /// before any re-attempt.
    async fn create_and_launch(
        &self,
        scanner: &dyn Scanner,
        job: &ScanJob,
    ) -> Result<String, ScanOutcome> {
        let mut attempt = 1;
        loop {
            let remote_id = match scanner.create_scan(job).await {
                Ok(remote_id) => remote_id,
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    sleep(self.retry.jittered_backoff(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(failure_outcome(e, FailureReason::CreateRejected)),
            };

            match scanner.launch_scan(&remote_id).await {
                Ok(_run_uuid) => return Ok(remote_id),
                Err(e) => {
                    // The create succeeded; remove the orphan before any
                    // retry or bail-out.
                    if let Err(del) = scanner.delete_scan(&remote_id).await {
                        tracing::warn!(
                            task_id = %job.task_id,
                            remote_id = %remote_id,
                            error = %del,
                            "Rollback delete_scan failed"
                        );
                    }
                    if e.is_transient() && attempt < self.retry.max_attempts {
                        sleep(self.retry.jittered_backoff(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(failure_outcome(e, FailureReason::LaunchRejected));
                }
            }
        }
    }

    /// One status poll with transient retries.
    async fn poll_status(
        &self,
        scanner: &dyn Scanner,
        remote_id: &str,
    ) -> Result<RemoteStatus, ScanOutcome> {
        let mut attempt = 1;
        loop {
            match scanner.get_status(remote_id).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::debug!(
                        remote_id = %remote_id,
                        attempt,
                        error = %e,
                        "Transient status failure, retrying"
                    );
                    sleep(self.retry.jittered_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(failure_outcome(e, FailureReason::InternalError)),
            }
        }
    }

    async fn export_and_persist(
        &self,
        task: &ScanTask,
        scanner: &dyn Scanner,
        remote_id: &str,
    ) -> ScanOutcome {
        let mut attempt = 1;
        let bytes = loop {
            match scanner.export_results(remote_id).await {
                Ok(bytes) => break bytes,
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    sleep(self.retry.jittered_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return failure_outcome(e, FailureReason::ExportFailed),
            }
        };

        let artifact_path = match self
            .write_artifact(&task.id, scanner.export_extension(), &bytes)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                return ScanOutcome::Failed {
                    reason: FailureReason::ExportFailed,
                    detail: format!("artifact write failed: {}", e),
                }
            }
        };

        // Best-effort count; a result we cannot parse is still a result.
        let vulnerabilities = match parse_report(&bytes) {
            Ok(report) => Some(report.metadata.total_findings as u64),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Could not count findings");
                None
            }
        };

        ScanOutcome::Completed {
            artifact_path,
            vulnerabilities,
        }
    }

    /// Atomic artifact write: temp file in the task directory, then rename.
    async fn write_artifact(
        &self,
        task_id: &str,
        ext: &str,
        bytes: &[u8],
    ) -> std::io::Result<PathBuf> {
        let dir = artifact_dir(&self.config.data_dir, task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join("scan_native.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        let path = artifact_file(&self.config.data_dir, task_id, ext);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// Applies the terminal transition for an outcome.
    async fn finish(&self, task_id: &str, pool: &str, outcome: ScanOutcome) -> CoreResult<()> {
        match outcome {
            ScanOutcome::Completed {
                artifact_path,
                vulnerabilities,
            } => {
                match self.tasks.transition(task_id, TaskStatus::Completed).await {
                    Ok(_) => {
                        self.tasks
                            .update(
                                task_id,
                                TaskPatch {
                                    progress: Some(100),
                                    artifact_path: Some(artifact_path.display().to_string()),
                                    vulnerabilities_found: vulnerabilities,
                                    ..Default::default()
                                },
                            )
                            .await?;
                    }
                    // Cancelled in the last instant: a cancelled task must
                    // not carry an artifact path, so the export is dropped.
                    Err(CoreError::InvalidTransition { .. }) => {
                        tracing::debug!(task_id = %task_id, "Completion lost to cancellation");
                        if let Err(e) = tokio::fs::remove_dir_all(artifact_dir(
                            &self.config.data_dir,
                            task_id,
                        ))
                        .await
                        {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                tracing::warn!(task_id = %task_id, error = %e, "Orphan artifact cleanup failed");
                            }
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            ScanOutcome::Failed { reason, detail } => {
                tracing::warn!(task_id = %task_id, reason = %reason, detail = %detail, "Scan failed");
                self.tasks
                    .update(
                        task_id,
                        TaskPatch {
                            failure_reason: Some(reason),
                            ..Default::default()
                        },
                    )
                    .await?;
                match self.tasks.transition(task_id, TaskStatus::Failed).await {
                    Ok(_) => self.queue.to_dlq(pool, task_id, reason.as_str()).await?,
                    Err(CoreError::InvalidTransition { .. }) => {
                        tracing::debug!(task_id = %task_id, "Failure lost to cancellation")
                    }
                    Err(e) => return Err(e),
                }
            }
            ScanOutcome::CancelledByCaller => {
                // Already terminal; nothing to transition.
            }
            ScanOutcome::RemoteCancelled => {
                match self.tasks.transition(task_id, TaskStatus::Cancelled).await {
                    Ok(_) => {
                        self.tasks
                            .update(
                                task_id,
                                TaskPatch {
                                    failure_reason: Some(FailureReason::CancelledByUser),
                                    ..Default::default()
                                },
                            )
                            .await?;
                    }
                    Err(CoreError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn connection(
        &self,
        descriptor: &scanhive_shared::config::ScannerDescriptor,
    ) -> Result<Arc<dyn Scanner>, ScannerError> {
        let mut connections = self.connections.lock().await;
        if let Some(scanner) = connections.get(&descriptor.instance_key) {
            return Ok(scanner.clone());
        }
        let scanner = self.connector.connect(descriptor).await?;
        connections.insert(descriptor.instance_key.clone(), scanner.clone());
        Ok(scanner)
    }

    async fn close_connections(&self) {
        let mut connections = self.connections.lock().await;
        for (instance_key, scanner) in connections.drain() {
            tracing::debug!(instance_key = %instance_key, "Closing scanner connection");
            scanner.close().await;
        }
    }
}

fn failure_outcome(error: ScannerError, rejected_as: FailureReason) -> ScanOutcome {
    let reason = match &error {
        ScannerError::Unreachable(_) => FailureReason::ScannerUnreachable,
        ScannerError::AuthenticationFailed(_) => FailureReason::AuthenticationFailed,
        ScannerError::Rejected { .. } | ScannerError::Protocol(_) => rejected_as,
    };
    ScanOutcome::Failed {
        reason,
        detail: error.to_string(),
    }
}
