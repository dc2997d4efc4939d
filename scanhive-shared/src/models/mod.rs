/// Core domain models shared by the api and worker crates.
pub mod task;

pub use task::{generate_task_id, NewScan, ScanTask, ScanType, TaskStatus};
