/// Configuration for the scan core
///
/// Scalar settings come from environment variables (a `.env` file is honored
/// in development); the scanner instance set comes from a JSON file whose
/// entries are deserialized with `deny_unknown_fields`, so a typo'd key is a
/// load-time error rather than a silently ignored setting.
///
/// # Environment Variables
///
/// - `SCANHIVE_DATA_DIR`: artifact root (default: `./data`)
/// - `SCANHIVE_ARTIFACT_TTL_S`: artifact retention (default: 86400)
/// - `SCANHIVE_TASK_TTL_S`: stale-task retention (default: 604800)
/// - `SCANHIVE_POLL_INTERVAL_S`: scanner poll interval (default: 5)
/// - `SCANHIVE_SCAN_TIMEOUT_S`: per-scan wall clock bound (default: 3600)
/// - `SCANHIVE_MAX_QUEUE_DEPTH`: per-pool high-water mark (default: 1000)
/// - `SCANHIVE_DEQUEUE_TIMEOUT_MS`: bounded dequeue wait (default: 500)
/// - `SCANHIVE_DEFAULT_POOL`: pool used when a submit names none
///   (default: `nessus`)
/// - `SCANHIVE_IDEMPOTENCY_TTL_S`: idempotency window (default: 86400)
/// - `SCANHIVE_WORKER_POOLS`: comma-separated pools a worker consumes
///   (default: the default pool)
/// - `SCANHIVE_SCANNERS_FILE`: path to the scanner descriptor JSON
///
/// # Example
///
/// ```no_run
/// use scanhive_shared::config::Config;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = Config::from_env()?;
/// println!("artifacts under {}", config.data_dir.display());
/// # Ok(())
/// # }
/// ```
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One addressable backend scanner instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScannerDescriptor {
    /// Pool this instance serves
    pub pool: String,

    /// Unique instance key, e.g. `nessus-dmz-01`
    pub instance_key: String,

    /// Backend product type, e.g. `nessus`
    pub scanner_type: String,

    /// Base URL of the instance
    pub url: String,

    /// Reference to a credentials entry (never the secret itself)
    pub credentials: String,

    /// Disabled instances are never selected
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Concurrency cap for this instance
    pub max_concurrent_scans: u32,
}

fn default_enabled() -> bool {
    true
}

/// Complete core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Artifact root directory
    pub data_dir: PathBuf,

    /// Retention for artifacts of completed scans, seconds
    pub artifact_ttl_s: u64,

    /// Retention for tasks that never reached a terminal state, seconds
    pub task_ttl_s: u64,

    /// Scanner status poll interval, seconds
    pub poll_interval_s: u64,

    /// Per-scan wall clock bound, seconds
    pub scan_timeout_s: u64,

    /// Per-pool queue high-water mark
    pub max_queue_depth: u64,

    /// Bounded dequeue wait, milliseconds
    pub dequeue_timeout_ms: u64,

    /// Pool used when a submission names none
    pub default_pool: String,

    /// Idempotency-key retention, seconds
    pub idempotency_ttl_s: u64,

    /// Pools this worker process consumes
    pub worker_pools: Vec<String>,

    /// Configured scanner instances
    pub scanners: Vec<ScannerDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            artifact_ttl_s: 86_400,
            task_ttl_s: 604_800,
            poll_interval_s: 5,
            scan_timeout_s: 3_600,
            max_queue_depth: 1_000,
            dequeue_timeout_ms: 500,
            default_pool: "nessus".to_string(),
            idempotency_ttl_s: 86_400,
            worker_pools: vec!["nessus".to_string()],
            scanners: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, reading the scanner
    /// descriptor file if `SCANHIVE_SCANNERS_FILE` is set.
    ///
    /// # Errors
    ///
    /// Returns an error on an unparsable value or an invalid descriptor
    /// file.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        if let Ok(dir) = env::var("SCANHIVE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.artifact_ttl_s = parse_env("SCANHIVE_ARTIFACT_TTL_S", config.artifact_ttl_s)?;
        config.task_ttl_s = parse_env("SCANHIVE_TASK_TTL_S", config.task_ttl_s)?;
        config.poll_interval_s = parse_env("SCANHIVE_POLL_INTERVAL_S", config.poll_interval_s)?;
        config.scan_timeout_s = parse_env("SCANHIVE_SCAN_TIMEOUT_S", config.scan_timeout_s)?;
        config.max_queue_depth = parse_env("SCANHIVE_MAX_QUEUE_DEPTH", config.max_queue_depth)?;
        config.dequeue_timeout_ms =
            parse_env("SCANHIVE_DEQUEUE_TIMEOUT_MS", config.dequeue_timeout_ms)?;
        config.idempotency_ttl_s =
            parse_env("SCANHIVE_IDEMPOTENCY_TTL_S", config.idempotency_ttl_s)?;

        if let Ok(pool) = env::var("SCANHIVE_DEFAULT_POOL") {
            config.default_pool = pool;
        }
        config.worker_pools = match env::var("SCANHIVE_WORKER_POOLS") {
            Ok(pools) => pools
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            Err(_) => vec![config.default_pool.clone()],
        };
        if config.worker_pools.is_empty() {
            anyhow::bail!("SCANHIVE_WORKER_POOLS must name at least one pool");
        }

        if let Ok(path) = env::var("SCANHIVE_SCANNERS_FILE") {
            config.scanners = load_scanners(Path::new(&path))?;
        }

        Ok(config)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_s)
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_s)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_s)
    }
}

/// Reads and validates the scanner descriptor file.
///
/// Unknown keys inside a descriptor are rejected; duplicate instance keys
/// are rejected here rather than surfacing later as registry surprises.
pub fn load_scanners(path: &Path) -> anyhow::Result<Vec<ScannerDescriptor>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read scanner file {}: {}", path.display(), e))?;
    let scanners: Vec<ScannerDescriptor> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("invalid scanner file {}: {}", path.display(), e))?;

    let mut seen = std::collections::HashSet::new();
    for scanner in &scanners {
        if !seen.insert(scanner.instance_key.as_str()) {
            anyhow::bail!("duplicate instance_key: {}", scanner.instance_key);
        }
        if scanner.max_concurrent_scans == 0 {
            anyhow::bail!(
                "instance {} has max_concurrent_scans = 0",
                scanner.instance_key
            );
        }
    }
    Ok(scanners)
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}
