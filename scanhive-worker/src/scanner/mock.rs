/// Mock scanner for tests and demos
///
/// Simulates the full remote-scan lifecycle deterministically: created scans
/// sit `pending` until launched, report `running` with rising progress for a
/// configurable number of polls, then settle into a configurable final
/// state. Failure injection covers each lifecycle step, and every call is
/// counted so tests can assert exact interaction sequences (e.g. "stop_scan
/// was invoked exactly once").
///
/// # Configuration
///
/// ```
/// use scanhive_worker::scanner::{MockScanner, MockScannerConfig};
///
/// let scanner = MockScanner::with_config(MockScannerConfig {
///     polls_to_complete: 3,
///     fail_launch: true,
///     ..Default::default()
/// });
/// assert_eq!(scanner.launch_calls(), 0);
/// ```
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use scanhive_shared::config::ScannerDescriptor;

use super::{
    RemoteScanState, RemoteStatus, ScanJob, Scanner, ScannerConnector, ScannerError,
    ScannerResult,
};

/// Mock scanner behavior knobs
#[derive(Debug, Clone)]
pub struct MockScannerConfig {
    /// Status polls before the scan reaches its final state
    pub polls_to_complete: u32,

    /// State reported once polling finishes
    pub final_state: RemoteScanState,

    /// Reject create_scan
    pub fail_create: bool,

    /// Reject launch_scan
    pub fail_launch: bool,

    /// Reject export_results
    pub fail_export: bool,

    /// Inject this many transient transport errors into get_status before
    /// answering normally
    pub transient_status_errors: u32,
}

impl Default for MockScannerConfig {
    fn default() -> Self {
        MockScannerConfig {
            polls_to_complete: 2,
            final_state: RemoteScanState::Completed,
            fail_create: false,
            fail_launch: false,
            fail_export: false,
            transient_status_errors: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ScanSim {
    launched: bool,
    stopped: bool,
    polls: u32,
}

/// Deterministic in-memory [`Scanner`]
pub struct MockScanner {
    config: MockScannerConfig,
    export: Bytes,
    scans: Mutex<HashMap<String, ScanSim>>,
    next_id: AtomicU32,
    transient_left: AtomicU32,
    create_calls: AtomicU32,
    launch_calls: AtomicU32,
    status_calls: AtomicU32,
    export_calls: AtomicU32,
    stop_calls: AtomicU32,
    delete_calls: AtomicU32,
    closed: AtomicU32,
}

impl MockScanner {
    pub fn new() -> Self {
        Self::with_config(MockScannerConfig::default())
    }

    pub fn with_config(config: MockScannerConfig) -> Self {
        let transient = config.transient_status_errors;
        MockScanner {
            config,
            export: Self::sample_export(3),
            scans: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            transient_left: AtomicU32::new(transient),
            create_calls: AtomicU32::new(0),
            launch_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            export_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            delete_calls: AtomicU32::new(0),
            closed: AtomicU32::new(0),
        }
    }

    /// Overrides the bytes `export_results` returns.
    pub fn with_export(mut self, export: Bytes) -> Self {
        self.export = export;
        self
    }

    /// Builds a small deterministic native export with `findings` items of
    /// rotating severity.
    pub fn sample_export(findings: usize) -> Bytes {
        let mut xml = String::from(
            "<?xml version=\"1.0\"?>\n<NessusClientData_v2>\n<Report name=\"mock scan\">\n<ReportHost name=\"10.0.0.5\">\n",
        );
        for i in 0..findings {
            let severity = i % 5;
            xml.push_str(&format!(
                concat!(
                    "<ReportItem pluginID=\"{}\" severity=\"{}\" pluginName=\"Mock finding {}\" ",
                    "port=\"443\" protocol=\"tcp\">\n",
                    "<synopsis>Mock synopsis {}</synopsis>\n",
                    "<description>Mock description {}</description>\n",
                    "<solution>Apply the vendor patch.</solution>\n",
                    "<cvss_base_score>{}.0</cvss_base_score>\n",
                    "<cvss3_base_score>{}.5</cvss3_base_score>\n",
                    "<exploit_available>{}</exploit_available>\n",
                    "<cve>CVE-2024-{:04}</cve>\n",
                    "</ReportItem>\n"
                ),
                10000 + i,
                severity,
                i,
                i,
                i,
                severity * 2,
                severity * 2,
                severity >= 3,
                i,
            ));
        }
        xml.push_str("</ReportHost>\n</Report>\n</NessusClientData_v2>\n");
        Bytes::from(xml)
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn launch_calls(&self) -> u32 {
        self.launch_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn export_calls(&self) -> u32 {
        self.export_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) > 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScanSim>> {
        self.scans.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scanner for MockScanner {
    async fn create_scan(&self, job: &ScanJob) -> ScannerResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_create {
            return Err(ScannerError::rejected(
                "create_scan",
                "mock configured to reject creates",
            ));
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().insert(id.clone(), ScanSim::default());
        tracing::debug!(task_id = %job.task_id, remote_id = %id, "Mock scan created");
        Ok(id)
    }

    async fn launch_scan(&self, remote_id: &str) -> ScannerResult<String> {
        self.launch_calls.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_launch {
            return Err(ScannerError::rejected(
                "launch_scan",
                "mock configured to reject launches",
            ));
        }
        let mut scans = self.lock();
        let sim = scans
            .get_mut(remote_id)
            .ok_or_else(|| ScannerError::rejected("launch_scan", "unknown scan"))?;
        sim.launched = true;
        Ok(format!("uuid-{}", remote_id))
    }

    async fn get_status(&self, remote_id: &str) -> ScannerResult<RemoteStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ScannerError::Unreachable("mock transient failure".into()));
        }

        let mut scans = self.lock();
        let sim = scans
            .get_mut(remote_id)
            .ok_or_else(|| ScannerError::rejected("get_status", "unknown scan"))?;

        if sim.stopped {
            return Ok(RemoteStatus {
                state: RemoteScanState::Stopped,
                progress: (sim.polls * 100 / self.config.polls_to_complete.max(1)).min(100) as u8,
            });
        }
        if !sim.launched {
            return Ok(RemoteStatus {
                state: RemoteScanState::Pending,
                progress: 0,
            });
        }

        sim.polls += 1;
        if sim.polls >= self.config.polls_to_complete {
            Ok(RemoteStatus {
                state: self.config.final_state,
                progress: 100,
            })
        } else {
            Ok(RemoteStatus {
                state: RemoteScanState::Running,
                progress: (sim.polls * 100 / self.config.polls_to_complete.max(1)).min(99) as u8,
            })
        }
    }

    async fn export_results(&self, remote_id: &str) -> ScannerResult<Bytes> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        if self.config.fail_export {
            return Err(ScannerError::rejected(
                "export_results",
                "mock configured to reject exports",
            ));
        }
        if !self.lock().contains_key(remote_id) {
            return Err(ScannerError::rejected("export_results", "unknown scan"));
        }
        Ok(self.export.clone())
    }

    async fn stop_scan(&self, remote_id: &str) -> ScannerResult<bool> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut scans = self.lock();
        match scans.get_mut(remote_id) {
            Some(sim) if sim.launched && !sim.stopped => {
                sim.stopped = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn delete_scan(&self, remote_id: &str) -> ScannerResult<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().remove(remote_id).is_some())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out [`MockScanner`]s per instance key
///
/// Tests preload specific scanners with [`MockConnector::with_scanner`];
/// unknown instances get a default mock on first connect.
#[derive(Default)]
pub struct MockConnector {
    scanners: Mutex<HashMap<String, Arc<MockScanner>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scanner(self, instance_key: &str, scanner: Arc<MockScanner>) -> Self {
        self.scanners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_key.to_string(), scanner);
        self
    }

    /// The scanner bound to an instance, if one has been connected.
    pub fn scanner(&self, instance_key: &str) -> Option<Arc<MockScanner>> {
        self.scanners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_key)
            .cloned()
    }
}

#[async_trait]
impl ScannerConnector for MockConnector {
    async fn connect(&self, descriptor: &ScannerDescriptor) -> ScannerResult<Arc<dyn Scanner>> {
        let mut scanners = self.scanners.lock().unwrap_or_else(|e| e.into_inner());
        let scanner = scanners
            .entry(descriptor.instance_key.clone())
            .or_insert_with(|| Arc::new(MockScanner::new()))
            .clone();
        Ok(scanner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanhive_shared::models::ScanType;

    fn job() -> ScanJob {
        ScanJob {
            task_id: "t-1".to_string(),
            targets: "10.0.0.5".to_string(),
            scan_name: "mock".to_string(),
            description: None,
            scan_type: ScanType::Untrusted,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_completes() {
        let scanner = MockScanner::with_config(MockScannerConfig {
            polls_to_complete: 3,
            ..Default::default()
        });

        let id = scanner.create_scan(&job()).await.unwrap();
        scanner.launch_scan(&id).await.unwrap();

        let s1 = scanner.get_status(&id).await.unwrap();
        assert_eq!(s1.state, RemoteScanState::Running);
        assert!(s1.progress < 100);
        let s2 = scanner.get_status(&id).await.unwrap();
        assert_eq!(s2.state, RemoteScanState::Running);
        let s3 = scanner.get_status(&id).await.unwrap();
        assert_eq!(s3.state, RemoteScanState::Completed);
        assert_eq!(s3.progress, 100);

        let export = scanner.export_results(&id).await.unwrap();
        assert!(!export.is_empty());
    }

    #[tokio::test]
    async fn test_pending_until_launched() {
        let scanner = MockScanner::new();
        let id = scanner.create_scan(&job()).await.unwrap();
        let status = scanner.get_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteScanState::Pending);
    }

    #[tokio::test]
    async fn test_stop_scan() {
        let scanner = MockScanner::with_config(MockScannerConfig {
            polls_to_complete: 100,
            ..Default::default()
        });
        let id = scanner.create_scan(&job()).await.unwrap();
        scanner.launch_scan(&id).await.unwrap();
        scanner.get_status(&id).await.unwrap();

        assert!(scanner.stop_scan(&id).await.unwrap());
        // already stopped
        assert!(!scanner.stop_scan(&id).await.unwrap());
        let status = scanner.get_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteScanState::Stopped);
        assert_eq!(scanner.stop_calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_then_recovery() {
        let scanner = MockScanner::with_config(MockScannerConfig {
            transient_status_errors: 2,
            polls_to_complete: 1,
            ..Default::default()
        });
        let id = scanner.create_scan(&job()).await.unwrap();
        scanner.launch_scan(&id).await.unwrap();

        assert!(scanner.get_status(&id).await.unwrap_err().is_transient());
        assert!(scanner.get_status(&id).await.unwrap_err().is_transient());
        let status = scanner.get_status(&id).await.unwrap();
        assert_eq!(status.state, RemoteScanState::Completed);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let scanner = MockScanner::with_config(MockScannerConfig {
            fail_create: true,
            ..Default::default()
        });
        assert!(scanner.create_scan(&job()).await.is_err());

        let scanner = MockScanner::with_config(MockScannerConfig {
            fail_launch: true,
            ..Default::default()
        });
        let id = scanner.create_scan(&job()).await.unwrap();
        assert!(scanner.launch_scan(&id).await.is_err());
        assert!(scanner.delete_scan(&id).await.unwrap());
        assert!(!scanner.delete_scan(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_sample_export_parses() {
        let export = MockScanner::sample_export(7);
        let report = scanhive_shared::report::parse_report(&export).unwrap();
        assert_eq!(report.metadata.total_findings, 7);
        assert_eq!(report.metadata.host_count, 1);
    }

    #[tokio::test]
    async fn test_connector_reuses_instances() {
        let connector = MockConnector::new();
        let descriptor = ScannerDescriptor {
            pool: "nessus".to_string(),
            instance_key: "nessus-01".to_string(),
            scanner_type: "nessus".to_string(),
            url: "https://mock:8834".to_string(),
            credentials: "vault:mock".to_string(),
            enabled: true,
            max_concurrent_scans: 5,
        };
        let a = connector.connect(&descriptor).await.unwrap();
        let b = connector.connect(&descriptor).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
