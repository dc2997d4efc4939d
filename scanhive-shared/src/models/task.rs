/// Scan task model and state machine
///
/// A `ScanTask` is the canonical record for one requested scan. It is stored
/// as a JSON blob under `task:<id>` and only ever mutated through
/// compare-and-set, so the state machine below is enforced even with many
/// workers racing on the same record.
///
/// # State Machine
///
/// ```text
/// queued → running → completed → expired
///        ↘ cancelled        ↘ failed
/// queued → cancelled
/// queued/running → expired          (TTL sweep)
/// ```
///
/// `completed`, `failed`, `cancelled` and `expired` are terminal; the only
/// transition out of a terminal state is `completed → expired`, taken by the
/// TTL housekeeper when the artifact retention window lapses.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureReason;

/// Scan execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in a pool queue for a worker
    Queued,

    /// A worker owns the task and is driving the remote scan
    Running,

    /// Scan finished and the artifact was persisted
    Completed,

    /// Scan failed terminally; `failure_reason` says why
    Failed,

    /// Cancelled by a caller before completion
    Cancelled,

    /// Reaped by the TTL housekeeper
    Expired,
}

impl TaskStatus {
    /// String form used in queue keys, filters, and responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Expired => "expired",
        }
    }

    /// Parses the string form. Returns None for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "expired" => Some(TaskStatus::Expired),
            _ => None,
        }
    }

    /// Whether the task has finished for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }

    /// The allowed-edge set of the state machine.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        match (self, target) {
            (TaskStatus::Queued, TaskStatus::Running) => true,
            (TaskStatus::Queued, TaskStatus::Cancelled) => true,
            (TaskStatus::Queued, TaskStatus::Expired) => true,

            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Cancelled) => true,
            (TaskStatus::Running, TaskStatus::Expired) => true,

            // Artifact retention lapse on a finished scan.
            (TaskStatus::Completed, TaskStatus::Expired) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of scan to run against the targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    /// Unauthenticated network scan
    Untrusted,

    /// Credentialed scan
    Authenticated,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Untrusted => "untrusted",
            ScanType::Authenticated => "authenticated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "untrusted" => Some(ScanType::Untrusted),
            "authenticated" => Some(ScanType::Authenticated),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical scan task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTask {
    /// Stable task id, `<scanner-type>-<instance-tag>-<UTC-timestamp>`
    pub id: String,

    /// Kind of scan requested
    pub scan_type: ScanType,

    /// Scan targets (hosts, CIDRs, comma-separated)
    pub targets: String,

    /// Human-readable scan name
    pub scan_name: String,

    /// Optional free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Pool this task is queued on
    pub scanner_pool: String,

    /// Client-supplied idempotency key, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Current state
    pub status: TaskStatus,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When a worker took the task (queued → running)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Last liveness stamp from the owning worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Worker id that last stamped a heartbeat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Scanner instance bound at dequeue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_instance_key: Option<String>,

    /// Backend scan id bound after create_scan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_scan_id: Option<String>,

    /// Scan progress, 0–100
    pub progress: u8,

    /// Finding count, set on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerabilities_found: Option<u64>,

    /// Why the task ended: one of the closed reason set, written when the
    /// task fails or is cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    /// Path to the persisted native export; set only on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

/// Input for creating a scan task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScan {
    pub targets: String,
    pub scan_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub scan_type: ScanType,
    pub scanner_pool: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ScanTask {
    /// Builds a fresh record in `queued` state.
    pub fn new(id: String, scan: NewScan) -> Self {
        ScanTask {
            id,
            scan_type: scan.scan_type,
            targets: scan.targets,
            scan_name: scan.scan_name,
            description: scan.description,
            scanner_pool: scan.scanner_pool,
            idempotency_key: scan.idempotency_key,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
            worker_id: None,
            scanner_instance_key: None,
            remote_scan_id: None,
            progress: 0,
            vulnerabilities_found: None,
            failure_reason: None,
            artifact_path: None,
        }
    }
}

/// Generates a task id in the submitter namespace:
/// `<scanner-type>-<instance-tag>-<UTC-timestamp>`.
///
/// The timestamp carries microseconds; the task store's create-if-absent
/// guard catches the rare same-microsecond collision and the caller
/// regenerates.
pub fn generate_task_id(scanner_type: &str, instance_tag: &str) -> String {
    format!(
        "{}-{}-{}",
        scanner_type,
        instance_tag,
        Utc::now().format("%Y%m%dT%H%M%S%6f")
    )
}
