//! # scanhive-worker
//!
//! The dispatch side of scanhive: the scanner capability interface and its
//! mock implementation, the dispatch loop that drives queued tasks through
//! the remote scan lifecycle, the stale-heartbeat reaper, and the TTL
//! housekeeper.
//!
//! Any number of worker processes may run against the same store; queue
//! pops and compare-and-set task transitions keep them from stepping on
//! each other.

pub mod dispatch;
pub mod housekeeper;
pub mod reaper;
pub mod retry;
pub mod scanner;

pub use dispatch::{ScanDispatcher, WorkerConfig};
pub use housekeeper::TtlHousekeeper;
pub use reaper::HeartbeatReaper;
pub use retry::RetryPolicy;
