/// Scanner capability interface
///
/// The contract every backend scanner adapter implements. The dispatch loop
/// drives a scan through create → launch → poll → export; authentication,
/// session management, and per-request retry policy are the adapter's
/// concern, not the core's.
///
/// # Lifecycle
///
/// ```text
/// create_scan ──> launch_scan ──> get_status* ──> export_results
///                                      │
///                   stop_scan <────────┘  (cancellation / timeout)
/// delete_scan  (rollback after a failed launch)
/// ```
///
/// # State normalization
///
/// Backends report their own state vocabulary; [`RemoteScanState::normalized`]
/// maps it onto the task state machine: `pending|paused → queued`,
/// `running → running`, `completed → completed`, `stopped|canceled →
/// cancelled`, `aborted|error → failed`.
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use scanhive_shared::config::ScannerDescriptor;
use scanhive_shared::models::{ScanType, TaskStatus};

pub mod mock;

pub use mock::{MockConnector, MockScanner, MockScannerConfig};

/// Scanner adapter error
#[derive(Debug, Error)]
pub enum ScannerError {
    /// Transport failure; worth retrying
    #[error("scanner unreachable: {0}")]
    Unreachable(String),

    /// Credentials rejected
    #[error("scanner authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Backend rejected the request outright (4xx-class)
    #[error("scanner rejected {operation}: {message}")]
    Rejected { operation: String, message: String },

    /// Backend answered with something we cannot interpret
    #[error("scanner protocol error: {0}")]
    Protocol(String),
}

impl ScannerError {
    /// Transient errors are retried with backoff; the rest fail fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScannerError::Unreachable(_))
    }

    pub fn rejected(operation: &str, message: impl Into<String>) -> Self {
        ScannerError::Rejected {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

pub type ScannerResult<T> = Result<T, ScannerError>;

/// Backend-reported scan state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteScanState {
    Pending,
    Paused,
    Running,
    Completed,
    Stopped,
    Canceled,
    Aborted,
    Error,
}

impl RemoteScanState {
    /// Maps the backend vocabulary onto the task state machine.
    pub fn normalized(&self) -> TaskStatus {
        match self {
            RemoteScanState::Pending | RemoteScanState::Paused => TaskStatus::Queued,
            RemoteScanState::Running => TaskStatus::Running,
            RemoteScanState::Completed => TaskStatus::Completed,
            RemoteScanState::Stopped | RemoteScanState::Canceled => TaskStatus::Cancelled,
            RemoteScanState::Aborted | RemoteScanState::Error => TaskStatus::Failed,
        }
    }
}

/// One status poll result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStatus {
    pub state: RemoteScanState,

    /// Progress 0–100 as the backend reports it
    pub progress: u8,
}

/// What the worker asks a scanner to run
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub task_id: String,
    pub targets: String,
    pub scan_name: String,
    pub description: Option<String>,
    pub scan_type: ScanType,
}

/// Backend scanner capability contract
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Creates a scan definition on the backend, returning its remote id.
    async fn create_scan(&self, job: &ScanJob) -> ScannerResult<String>;

    /// Launches a previously created scan, returning the run uuid.
    async fn launch_scan(&self, remote_id: &str) -> ScannerResult<String>;

    /// Polls scan state and progress.
    async fn get_status(&self, remote_id: &str) -> ScannerResult<RemoteStatus>;

    /// Exports the finished scan in the backend's native format.
    async fn export_results(&self, remote_id: &str) -> ScannerResult<Bytes>;

    /// Asks the backend to stop a running scan. Returns false if there was
    /// nothing to stop.
    async fn stop_scan(&self, remote_id: &str) -> ScannerResult<bool>;

    /// Removes a scan definition from the backend. Returns false if it was
    /// already gone.
    async fn delete_scan(&self, remote_id: &str) -> ScannerResult<bool>;

    /// Tears down sessions. Called once at worker shutdown.
    async fn close(&self);

    /// File extension for the native export artifact.
    fn export_extension(&self) -> &str {
        "nessus"
    }
}

/// Opens scanner connections for registry instances
///
/// The dispatcher caches one connection per instance key for its lifetime
/// and closes them all at shutdown.
#[async_trait]
pub trait ScannerConnector: Send + Sync {
    async fn connect(&self, descriptor: &ScannerDescriptor) -> ScannerResult<Arc<dyn Scanner>>;
}
