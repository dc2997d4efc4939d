/// TTL housekeeper
///
/// Two retention sweeps over the task store:
///
/// - completed tasks whose `completed_at + artifact_ttl` has lapsed lose
///   their artifact directory and move to `expired`
/// - non-terminal tasks older than `task_ttl` (a longer bound) are expired
///   outright; they cover tasks stranded by crashed submitters
///
/// Both sweeps are idempotent and crash-safe: deleting an artifact that is
/// already gone is fine, and a sweep interrupted mid-pass simply finishes
/// the work on its next run. Every expiry bumps a deletions counter in the
/// store.
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use scanhive_shared::config::Config;
use scanhive_shared::error::{CoreError, CoreResult};
use scanhive_shared::models::TaskStatus;
use scanhive_shared::store::KvStore;
use scanhive_shared::tasks::{artifact_dir, TaskStore};

/// Counter key for expired-task deletions.
pub const DELETIONS_KEY: &str = "stats:deletions";

pub struct TtlHousekeeper {
    tasks: TaskStore,
    store: Arc<dyn KvStore>,
    data_dir: PathBuf,
    artifact_ttl: Duration,
    task_ttl: Duration,
    sweep_interval: Duration,
}

impl TtlHousekeeper {
    pub fn new(tasks: TaskStore, store: Arc<dyn KvStore>, config: &Config) -> Self {
        TtlHousekeeper {
            tasks,
            store,
            data_dir: config.data_dir.clone(),
            artifact_ttl: config.artifact_ttl(),
            task_ttl: config.task_ttl(),
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// One full pass. Returns how many tasks were expired.
    pub async fn sweep(&self) -> CoreResult<usize> {
        let now = Utc::now();
        let artifact_ttl = chrono::Duration::from_std(self.artifact_ttl)
            .map_err(|e| CoreError::Internal(format!("artifact_ttl out of range: {}", e)))?;
        let task_ttl = chrono::Duration::from_std(self.task_ttl)
            .map_err(|e| CoreError::Internal(format!("task_ttl out of range: {}", e)))?;

        let mut expired = 0;
        for task in self.tasks.load_all().await? {
            let due = match task.status {
                TaskStatus::Completed => task
                    .completed_at
                    .map_or(false, |done| now - done > artifact_ttl),
                TaskStatus::Queued | TaskStatus::Running => now - task.created_at > task_ttl,
                _ => false,
            };
            if !due {
                continue;
            }

            self.remove_artifacts(&task.id).await?;
            match self.tasks.transition(&task.id, TaskStatus::Expired).await {
                Ok(_) => {
                    self.store.incr(DELETIONS_KEY, 1).await?;
                    expired += 1;
                    tracing::info!(task_id = %task.id, "Task expired");
                }
                // Lost the race to a worker or another housekeeper; the
                // artifact removal above was already idempotent.
                Err(CoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Removes a task's artifact directory. Missing directories are not an
    /// error.
    async fn remove_artifacts(&self, task_id: &str) -> CoreResult<()> {
        let dir = artifact_dir(&self.data_dir, task_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Internal(format!(
                "cannot remove artifact dir {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    /// Sweeps on an interval until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            artifact_ttl_s = self.artifact_ttl.as_secs(),
            task_ttl_s = self.task_ttl.as_secs(),
            "TTL housekeeper starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.sweep_interval) => {}
            }
            match self.sweep().await {
                Ok(0) => {}
                Ok(expired) => tracing::info!(expired, "Housekeeping pass complete"),
                Err(e) => tracing::error!(error = %e, "Housekeeping pass failed"),
            }
        }
        tracing::info!("TTL housekeeper shut down");
    }
}
