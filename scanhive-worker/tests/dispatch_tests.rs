//! End-to-end dispatch tests over MemoryStore and MockScanner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use scanhive_shared::config::ScannerDescriptor;
use scanhive_shared::error::FailureReason;
use scanhive_shared::models::{NewScan, ScanTask, ScanType, TaskStatus};
use scanhive_shared::queue::ScanQueue;
use scanhive_shared::registry::ScannerRegistry;
use scanhive_shared::store::MemoryStore;
use scanhive_shared::tasks::{artifact_file, TaskStore};
use scanhive_worker::dispatch::{ScanDispatcher, WorkerConfig};
use scanhive_worker::retry::RetryPolicy;
use scanhive_worker::scanner::{MockConnector, MockScanner, MockScannerConfig, RemoteScanState};

struct Harness {
    tasks: TaskStore,
    queue: ScanQueue,
    registry: Arc<ScannerRegistry>,
    connector: Arc<MockConnector>,
    data_dir: TempDir,
}

fn descriptor(key: &str, pool: &str, max: u32) -> ScannerDescriptor {
    ScannerDescriptor {
        pool: pool.to_string(),
        instance_key: key.to_string(),
        scanner_type: "nessus".to_string(),
        url: format!("https://{}.local:8834", key),
        credentials: format!("vault:{}", key),
        enabled: true,
        max_concurrent_scans: max,
    }
}

fn harness(descriptors: Vec<ScannerDescriptor>, connector: MockConnector) -> Harness {
    let store = Arc::new(MemoryStore::new());
    Harness {
        tasks: TaskStore::new(store.clone()),
        queue: ScanQueue::new(store, 100),
        registry: Arc::new(ScannerRegistry::new(descriptors).unwrap()),
        connector: Arc::new(connector),
        data_dir: TempDir::new().unwrap(),
    }
}

impl Harness {
    fn dispatcher(&self, pools: &[&str]) -> Arc<ScanDispatcher> {
        let config = WorkerConfig {
            worker_pools: pools.iter().map(|p| p.to_string()).collect(),
            poll_interval: Duration::from_millis(10),
            scan_timeout: Duration::from_secs(5),
            dequeue_timeout: Duration::from_millis(50),
            data_dir: self.data_dir.path().to_path_buf(),
        };
        Arc::new(
            ScanDispatcher::new(
                self.tasks.clone(),
                self.queue.clone(),
                self.registry.clone(),
                self.connector.clone(),
                config,
            )
            .with_retry(RetryPolicy::fast()),
        )
    }

    fn spawn(&self, dispatcher: &Arc<ScanDispatcher>) -> tokio::task::JoinHandle<()> {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.run().await.unwrap();
        })
    }

    async fn submit(&self, task_id: &str, pool: &str) {
        let task = ScanTask::new(
            task_id.to_string(),
            NewScan {
                targets: "192.168.1.1".to_string(),
                scan_name: format!("scan {}", task_id),
                description: None,
                scan_type: ScanType::Untrusted,
                scanner_pool: pool.to_string(),
                idempotency_key: None,
            },
        );
        self.tasks.create(&task).await.unwrap();
        self.queue.enqueue(pool, task_id).await.unwrap();
    }

    async fn wait_for_status(&self, task_id: &str, status: TaskStatus) -> ScanTask {
        wait_for(Duration::from_secs(3), || async {
            let task = self.tasks.get(task_id).await.unwrap();
            (task.status == status).then_some(task)
        })
        .await
        .unwrap_or_else(|| panic!("task {} never reached {}", task_id, status))
    }
}

async fn wait_for<T, F, Fut>(timeout: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn completed_scan_persists_artifact_and_counts_findings() {
    let scanner = Arc::new(
        MockScanner::with_config(MockScannerConfig {
            polls_to_complete: 2,
            ..Default::default()
        })
        .with_export(MockScanner::sample_export(5)),
    );
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 2)],
        MockConnector::new().with_scanner("nessus-01", scanner.clone()),
    );

    h.submit("t-1", "nessus").await;
    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    h.wait_for_status("t-1", TaskStatus::Completed).await;
    // artifact fields land just after the terminal transition
    let task = wait_for(Duration::from_secs(3), || async {
        let task = h.tasks.get("t-1").await.unwrap();
        task.artifact_path.is_some().then_some(task)
    })
    .await
    .expect("artifact fields never recorded");
    assert_eq!(task.progress, 100);
    assert_eq!(task.vulnerabilities_found, Some(5));
    assert_eq!(task.scanner_instance_key.as_deref(), Some("nessus-01"));
    assert!(task.remote_scan_id.is_some());
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());

    // artifact at <data_dir>/<task_id>/scan_native.<ext>
    let artifact = artifact_file(h.data_dir.path(), "t-1", "nessus");
    assert!(artifact.exists());
    assert_eq!(task.artifact_path.as_deref(), Some(artifact.to_str().unwrap()));
    assert_eq!(scanner.export_calls(), 1);

    // capacity restored
    let status = h.registry.pool_status("nessus").unwrap();
    assert_eq!(status.total_active, 0);

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
    assert!(scanner.is_closed());
}

#[tokio::test]
async fn worker_consumes_only_its_pools() {
    let h = harness(
        vec![
            descriptor("nessus-01", "nessus", 2),
            descriptor("dmz-01", "dmz", 2),
            descriptor("lan-01", "lan", 2),
        ],
        MockConnector::new(),
    );

    h.submit("t-nessus", "nessus").await;
    h.submit("t-dmz", "dmz").await;
    h.submit("t-lan", "lan").await;

    let dispatcher = h.dispatcher(&["nessus", "dmz"]);
    let handle = h.spawn(&dispatcher);

    h.wait_for_status("t-nessus", TaskStatus::Completed).await;
    h.wait_for_status("t-dmz", TaskStatus::Completed).await;

    // the lan pool was never touched
    assert_eq!(h.queue.depth("lan").await.unwrap(), 1);
    assert_eq!(
        h.tasks.get("t-lan").await.unwrap().status,
        TaskStatus::Queued
    );

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn cancelling_running_scan_stops_remote_exactly_once() {
    let scanner = Arc::new(MockScanner::with_config(MockScannerConfig {
        polls_to_complete: 10_000,
        ..Default::default()
    }));
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new().with_scanner("nessus-01", scanner.clone()),
    );

    h.submit("t-1", "nessus").await;
    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    h.wait_for_status("t-1", TaskStatus::Running).await;

    // external cancel, as the ops surface does it
    h.tasks
        .transition("t-1", TaskStatus::Cancelled)
        .await
        .unwrap();

    // worker notices within a poll tick and stops the remote scan
    wait_for(Duration::from_secs(3), || async {
        (scanner.stop_calls() > 0).then_some(())
    })
    .await
    .expect("stop_scan was never invoked");
    assert_eq!(scanner.stop_calls(), 1);

    // reservation released
    wait_for(Duration::from_secs(3), || async {
        (h.registry.pool_status("nessus").unwrap().total_active == 0).then_some(())
    })
    .await
    .expect("reservation never released");

    assert_eq!(
        h.tasks.get("t-1").await.unwrap().status,
        TaskStatus::Cancelled
    );

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn launch_failure_rolls_back_and_dead_letters() {
    let scanner = Arc::new(MockScanner::with_config(MockScannerConfig {
        fail_launch: true,
        ..Default::default()
    }));
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new().with_scanner("nessus-01", scanner.clone()),
    );

    h.submit("t-1", "nessus").await;
    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    let task = h.wait_for_status("t-1", TaskStatus::Failed).await;
    assert_eq!(task.failure_reason, Some(FailureReason::LaunchRejected));

    // the orphaned create was rolled back
    assert!(scanner.delete_calls() >= 1);
    assert_eq!(scanner.delete_calls(), scanner.launch_calls());

    // dead-lettered with the reason verbatim
    let entries = h.queue.dlq_entries("nessus").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, "t-1");
    assert_eq!(entries[0].reason, "launch_rejected");

    assert_eq!(h.registry.pool_status("nessus").unwrap().total_active, 0);

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn transient_status_errors_are_retried() {
    let scanner = Arc::new(MockScanner::with_config(MockScannerConfig {
        polls_to_complete: 1,
        transient_status_errors: 2,
        ..Default::default()
    }));
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new().with_scanner("nessus-01", scanner.clone()),
    );

    h.submit("t-1", "nessus").await;
    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    h.wait_for_status("t-1", TaskStatus::Completed).await;

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn wall_clock_timeout_fails_and_stops_scan() {
    let scanner = Arc::new(MockScanner::with_config(MockScannerConfig {
        polls_to_complete: 10_000,
        ..Default::default()
    }));
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new().with_scanner("nessus-01", scanner.clone()),
    );

    h.submit("t-1", "nessus").await;
    let config = WorkerConfig {
        worker_pools: vec!["nessus".to_string()],
        poll_interval: Duration::from_millis(10),
        scan_timeout: Duration::from_millis(80),
        dequeue_timeout: Duration::from_millis(50),
        data_dir: h.data_dir.path().to_path_buf(),
    };
    let dispatcher = Arc::new(
        ScanDispatcher::new(
            h.tasks.clone(),
            h.queue.clone(),
            h.registry.clone(),
            h.connector.clone(),
            config,
        )
        .with_retry(RetryPolicy::fast()),
    );
    let handle = h.spawn(&dispatcher);

    let task = h.wait_for_status("t-1", TaskStatus::Failed).await;
    assert_eq!(task.failure_reason, Some(FailureReason::Timeout));
    assert_eq!(scanner.stop_calls(), 1);
    assert_eq!(
        h.queue.dlq_entries("nessus").await.unwrap()[0].reason,
        "timeout"
    );

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn task_cancelled_while_queued_is_dropped() {
    let scanner = Arc::new(MockScanner::new());
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new().with_scanner("nessus-01", scanner.clone()),
    );

    h.submit("t-1", "nessus").await;
    h.tasks
        .transition("t-1", TaskStatus::Cancelled)
        .await
        .unwrap();

    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    wait_for(Duration::from_secs(3), || async {
        (h.queue.depth("nessus").await.unwrap() == 0).then_some(())
    })
    .await
    .expect("queue never drained");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(scanner.create_calls(), 0);
    assert_eq!(
        h.tasks.get("t-1").await.unwrap().status,
        TaskStatus::Cancelled
    );

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn remote_stop_becomes_cancelled_with_reason() {
    let scanner = Arc::new(MockScanner::with_config(MockScannerConfig {
        polls_to_complete: 2,
        final_state: RemoteScanState::Stopped,
        ..Default::default()
    }));
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new().with_scanner("nessus-01", scanner.clone()),
    );

    h.submit("t-1", "nessus").await;
    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    h.wait_for_status("t-1", TaskStatus::Cancelled).await;
    // the reason is recorded one write after the transition
    let task = wait_for(Duration::from_secs(3), || async {
        let task = h.tasks.get("t-1").await.unwrap();
        task.failure_reason.is_some().then_some(task)
    })
    .await
    .expect("cancellation reason never recorded");
    assert_eq!(task.failure_reason, Some(FailureReason::CancelledByUser));

    // a cancellation is not a failure: nothing lands on the DLQ
    assert_eq!(h.queue.dlq_size("nessus").await.unwrap(), 0);
    assert_eq!(h.registry.pool_status("nessus").unwrap().total_active, 0);

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn remote_abort_becomes_failed() {
    let scanner = Arc::new(MockScanner::with_config(MockScannerConfig {
        polls_to_complete: 2,
        final_state: RemoteScanState::Aborted,
        ..Default::default()
    }));
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new().with_scanner("nessus-01", scanner.clone()),
    );

    h.submit("t-1", "nessus").await;
    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    let task = h.wait_for_status("t-1", TaskStatus::Failed).await;
    assert_eq!(task.failure_reason, Some(FailureReason::InternalError));
    assert_eq!(h.queue.dlq_size("nessus").await.unwrap(), 1);

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn saturated_pool_requeues_until_capacity_frees() {
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new(),
    );

    // occupy the only slot out-of-band
    let held = h.registry.reserve("nessus").unwrap();

    h.submit("t-1", "nessus").await;
    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    // task keeps cycling through the queue, never claimed
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.tasks.get("t-1").await.unwrap().status,
        TaskStatus::Queued
    );

    h.registry.release(&held);
    h.wait_for_status("t-1", TaskStatus::Completed).await;

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn fifo_order_is_preserved_for_single_worker() {
    let h = harness(
        vec![descriptor("nessus-01", "nessus", 1)],
        MockConnector::new(),
    );
    for i in 0..4 {
        h.submit(&format!("t-{}", i), "nessus").await;
    }

    let dispatcher = h.dispatcher(&["nessus"]);
    let handle = h.spawn(&dispatcher);

    let mut completions = Vec::new();
    for i in 0..4 {
        let task = h
            .wait_for_status(&format!("t-{}", i), TaskStatus::Completed)
            .await;
        completions.push((task.id.clone(), task.completed_at.unwrap()));
    }
    // single consumer: completion order equals enqueue order
    for window in completions.windows(2) {
        assert!(window[0].1 <= window[1].1, "{:?} finished out of order", window);
    }

    dispatcher.shutdown_token().cancel();
    handle.await.unwrap();
}
