/// Operations surface
///
/// [`ScanService`] is the one entry point clients of the core see. Each
/// operation lives in its own module with its request/response types:
///
/// - [`submit`]: `submit_scan`
/// - [`status`]: `get_scan_status`, `list_tasks`, `cancel_scan`
/// - [`results`]: `get_scan_results`
/// - [`pools`]: `list_scanners`, `list_pools`, `get_pool_status`,
///   `get_queue_status`, `dlq_clear`, `dlq_requeue`
///
/// Every failure maps onto the stable error codes of
/// [`scanhive_shared::error::CoreError`].
use std::sync::Arc;

use scanhive_shared::config::Config;
use scanhive_shared::idempotency::IdempotencyIndex;
use scanhive_shared::queue::ScanQueue;
use scanhive_shared::registry::ScannerRegistry;
use scanhive_shared::store::KvStore;
use scanhive_shared::tasks::TaskStore;

pub mod pools;
pub mod results;
pub mod status;
pub mod submit;

pub use pools::{DlqClearResponse, DlqRequeueResponse, ListPoolsResponse, ListScannersResponse, QueueStatusResponse};
pub use results::ResultsQuery;
pub use status::{CancelScanResponse, ListTasksRequest, ListTasksResponse, ScanStatusResponse};
pub use submit::{SubmitScanRequest, SubmitScanResponse};

/// The scan service
///
/// Collaborators are passed in explicitly; the service owns no global
/// state. Clones are cheap and share everything.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use scanhive_api::ScanService;
/// use scanhive_shared::config::Config;
/// use scanhive_shared::registry::ScannerRegistry;
/// use scanhive_shared::store::MemoryStore;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = Arc::new(Config::default());
/// let registry = Arc::new(ScannerRegistry::new(config.scanners.clone())?);
/// let service = ScanService::new(Arc::new(MemoryStore::new()), registry, config);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ScanService {
    pub(crate) tasks: TaskStore,
    pub(crate) queue: ScanQueue,
    pub(crate) idempotency: IdempotencyIndex,
    pub(crate) registry: Arc<ScannerRegistry>,
    pub(crate) config: Arc<Config>,
    /// Short tag identifying this service instance in generated task ids.
    pub(crate) instance_tag: String,
}

impl ScanService {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: Arc<ScannerRegistry>,
        config: Arc<Config>,
    ) -> Self {
        let tasks = TaskStore::new(store.clone());
        let queue = ScanQueue::new(store.clone(), config.max_queue_depth);
        let idempotency = IdempotencyIndex::new(store, config.idempotency_ttl());
        let instance_tag = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        ScanService {
            tasks,
            queue,
            idempotency,
            registry,
            config,
            instance_tag,
        }
    }

    /// The task store behind this service (worker wiring and tests).
    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// The queue behind this service (worker wiring and tests).
    pub fn queue(&self) -> &ScanQueue {
        &self.queue
    }
}
