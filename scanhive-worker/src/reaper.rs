/// Stale-heartbeat reaper
///
/// A worker stamps `last_heartbeat_at` on its running task every poll tick.
/// If a worker dies mid-scan, the task would sit `running` forever and its
/// reservation would never come back; this reaper marks any running task
/// whose heartbeat is older than 3 × the poll interval as `failed`, and
/// parks it on the DLQ so an operator can requeue it.
///
/// Sweeps are CAS-safe: a task that finishes between the listing and the
/// transition simply loses the `InvalidTransition` race and is skipped.
use chrono::Utc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use scanhive_shared::error::{CoreError, CoreResult, FailureReason};
use scanhive_shared::models::TaskStatus;
use scanhive_shared::queue::ScanQueue;
use scanhive_shared::tasks::{TaskFilter, TaskPatch, TaskStore};

/// Heartbeats older than this many poll intervals are stale.
pub const STALE_FACTOR: u32 = 3;

pub struct HeartbeatReaper {
    tasks: TaskStore,
    queue: ScanQueue,
    stale_after: Duration,
    sweep_interval: Duration,
}

impl HeartbeatReaper {
    pub fn new(tasks: TaskStore, queue: ScanQueue, poll_interval: Duration) -> Self {
        let stale_after = poll_interval * STALE_FACTOR;
        HeartbeatReaper {
            tasks,
            queue,
            stale_after,
            sweep_interval: stale_after,
        }
    }

    /// Overrides the sweep cadence (tests run tight loops).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// One pass over running tasks. Returns how many were reaped.
    pub async fn sweep(&self) -> CoreResult<usize> {
        let stale = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| CoreError::Internal(format!("stale bound out of range: {}", e)))?;
        let now = Utc::now();

        let running = self
            .tasks
            .list(
                &TaskFilter {
                    status: Some(TaskStatus::Running),
                    pool: None,
                },
                usize::MAX,
                None,
            )
            .await?;

        let mut reaped = 0;
        for task in running.tasks {
            let last_seen = task
                .last_heartbeat_at
                .or(task.started_at)
                .unwrap_or(task.created_at);
            if now - last_seen <= stale {
                continue;
            }

            tracing::warn!(
                task_id = %task.id,
                worker_id = ?task.worker_id,
                last_seen = %last_seen,
                "Reaping task with stale heartbeat"
            );
            self.tasks
                .update(
                    &task.id,
                    TaskPatch {
                        failure_reason: Some(FailureReason::InternalError),
                        ..Default::default()
                    },
                )
                .await?;
            match self.tasks.transition(&task.id, TaskStatus::Failed).await {
                Ok(_) => {
                    self.queue
                        .to_dlq(
                            &task.scanner_pool,
                            &task.id,
                            FailureReason::InternalError.as_str(),
                        )
                        .await?;
                    reaped += 1;
                }
                // Finished while we were sweeping.
                Err(CoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Sweeps on an interval until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            stale_after_s = self.stale_after.as_secs(),
            "Heartbeat reaper starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.sweep_interval) => {}
            }
            match self.sweep().await {
                Ok(0) => {}
                Ok(reaped) => tracing::info!(reaped, "Reaper pass complete"),
                Err(e) => tracing::error!(error = %e, "Reaper pass failed"),
            }
        }
        tracing::info!("Heartbeat reaper shut down");
    }
}
