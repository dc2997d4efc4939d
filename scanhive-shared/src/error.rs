/// Error types surfaced to callers of the scan core
///
/// Every fallible public operation in scanhive returns `Result<T, CoreError>`.
/// Each variant maps to a stable string code so the operations surface can
/// expose machine-readable errors without leaking internals.
///
/// # Example
///
/// ```
/// use scanhive_shared::error::CoreError;
///
/// let err = CoreError::NotFound("task nessus-a1b2c3d4-20250104T120000 not found".into());
/// assert_eq!(err.code(), "not_found");
/// assert!(!err.is_retryable());
/// ```
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Unified error type for the scan core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied an invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested state transition is not in the allowed set
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Results were requested before the task reached a readable state
    #[error("not ready: {0}")]
    NotReady(String),

    /// Queue depth exceeded the configured high-water mark (retryable)
    #[error("queue full: pool {pool} at depth {depth} (limit {limit})")]
    QueueFull {
        pool: String,
        depth: u64,
        limit: u64,
    },

    /// Idempotency collision with a different payload
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient failure in the persistence layer or a collaborator (retryable)
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Invariant violation or unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code for the operations surface.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::NotReady(_) => "not_ready",
            CoreError::QueueFull { .. } => "queue_full",
            CoreError::Conflict(_) => "conflict",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::QueueFull { .. } | CoreError::Unavailable(_))
    }
}

/// Terminal failure reason for a scan task
///
/// Closed set. The worker writes one of these to `failure_reason` when it
/// moves a task to `failed`, and the DLQ entry records the same string
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Scanner backend could not be reached after retries
    ScannerUnreachable,

    /// Scanner rejected our credentials
    AuthenticationFailed,

    /// Backend rejected the create request
    CreateRejected,

    /// Backend rejected the launch request
    LaunchRejected,

    /// Results export failed after the scan finished
    ExportFailed,

    /// Scan exceeded its wall-clock bound
    Timeout,

    /// Task was cancelled on request
    CancelledByUser,

    /// Anything else: invariant violations, remote aborts, lost workers
    InternalError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ScannerUnreachable => "scanner_unreachable",
            FailureReason::AuthenticationFailed => "authentication_failed",
            FailureReason::CreateRejected => "create_rejected",
            FailureReason::LaunchRejected => "launch_rejected",
            FailureReason::ExportFailed => "export_failed",
            FailureReason::Timeout => "timeout",
            FailureReason::CancelledByUser => "cancelled_by_user",
            FailureReason::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
