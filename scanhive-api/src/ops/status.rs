/// Task status, listing, and cancellation
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scanhive_shared::error::{CoreError, CoreResult, FailureReason};
use scanhive_shared::models::{ScanTask, TaskStatus};
use scanhive_shared::tasks::{TaskFilter, TaskPatch};

use super::ScanService;

/// Default page size for listings.
const DEFAULT_LIST_LIMIT: usize = 50;

/// Upper bound on one listing page.
const MAX_LIST_LIMIT: usize = 500;

/// Status response for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatusResponse {
    pub task_id: String,
    pub status: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanner_instance_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vulnerabilities_found: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl From<&ScanTask> for ScanStatusResponse {
    fn from(task: &ScanTask) -> Self {
        ScanStatusResponse {
            task_id: task.id.clone(),
            status: task.status.as_str().to_string(),
            progress: task.progress,
            scanner_instance_key: task.scanner_instance_key.clone(),
            started_at: task.started_at,
            completed_at: task.completed_at,
            vulnerabilities_found: task.vulnerabilities_found,
            failure_reason: task.failure_reason.map(|r| r.as_str().to_string()),
        }
    }
}

/// Listing request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTasksRequest {
    /// Filter by status string (`queued`, `running`, ...)
    #[serde(default)]
    pub status: Option<String>,

    /// Filter by pool
    #[serde(default)]
    pub pool: Option<String>,

    /// Page size, clamped to [1, 500]; 50 when omitted
    #[serde(default)]
    pub limit: Option<usize>,

    /// Cursor from a previous page
    #[serde(default)]
    pub cursor: Option<String>,
}

/// One row of a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub scan_name: String,
    pub scan_type: String,
    pub scanner_pool: String,
    pub status: String,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Listing response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<TaskSummary>,

    /// Total matching tasks across all pages
    pub total: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Cancellation response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelScanResponse {
    pub task_id: String,
    pub status: String,
}

impl ScanService {
    /// Current status of one task.
    ///
    /// # Errors
    ///
    /// `NotFound` if the task does not exist.
    pub async fn get_scan_status(&self, task_id: &str) -> CoreResult<ScanStatusResponse> {
        let task = self.tasks.get(task_id).await?;
        Ok(ScanStatusResponse::from(&task))
    }

    /// Lists tasks newest-first with cursor pagination.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on an unknown status filter or malformed cursor.
    pub async fn list_tasks(&self, req: ListTasksRequest) -> CoreResult<ListTasksResponse> {
        let status = req
            .status
            .as_deref()
            .map(|s| {
                TaskStatus::parse(s)
                    .ok_or_else(|| CoreError::InvalidArgument(format!("unknown status: {}", s)))
            })
            .transpose()?;

        let limit = req
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        let page = self
            .tasks
            .list(
                &TaskFilter {
                    status,
                    pool: req.pool,
                },
                limit,
                req.cursor.as_deref(),
            )
            .await?;

        Ok(ListTasksResponse {
            tasks: page
                .tasks
                .iter()
                .map(|task| TaskSummary {
                    task_id: task.id.clone(),
                    scan_name: task.scan_name.clone(),
                    scan_type: task.scan_type.as_str().to_string(),
                    scanner_pool: task.scanner_pool.clone(),
                    status: task.status.as_str().to_string(),
                    progress: task.progress,
                    created_at: task.created_at,
                    completed_at: task.completed_at,
                })
                .collect(),
            total: page.total,
            next_cursor: page.next_cursor,
        })
    }

    /// Cancels a queued or running task.
    ///
    /// A queued task is skipped when a worker eventually dequeues it; a
    /// running task's worker observes the state on its next poll tick and
    /// stops the remote scan. Cancelling an already-cancelled task succeeds
    /// silently; cancelling any other terminal task fails with
    /// `InvalidTransition`.
    pub async fn cancel_scan(&self, task_id: &str) -> CoreResult<CancelScanResponse> {
        match self.tasks.transition(task_id, TaskStatus::Cancelled).await {
            Ok(task) => {
                // Record why the task ended; status responses surface it.
                let task = self
                    .tasks
                    .update(
                        &task.id,
                        TaskPatch {
                            failure_reason: Some(FailureReason::CancelledByUser),
                            ..Default::default()
                        },
                    )
                    .await?;
                tracing::info!(task_id = %task_id, "Scan cancelled");
                Ok(CancelScanResponse {
                    task_id: task.id,
                    status: task.status.as_str().to_string(),
                })
            }
            Err(CoreError::InvalidTransition { from, to }) => {
                let task = self.tasks.get(task_id).await?;
                if task.status == TaskStatus::Cancelled {
                    // Idempotent repeat of a cancel.
                    Ok(CancelScanResponse {
                        task_id: task.id,
                        status: task.status.as_str().to_string(),
                    })
                } else {
                    Err(CoreError::InvalidTransition { from, to })
                }
            }
            Err(e) => Err(e),
        }
    }
}
