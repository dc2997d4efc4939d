//! # scanhive worker binary
//!
//! Wires the dispatch loop, the stale-heartbeat reaper, and the TTL
//! housekeeper against the Redis store and runs them until a shutdown
//! signal arrives. Shutdown drains the in-flight scan, stops the sweepers,
//! and closes every scanner connection.
//!
//! ## Usage
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 \
//! SCANHIVE_SCANNERS_FILE=scanners.json \
//! cargo run -p scanhive-worker
//! ```

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scanhive_shared::config::Config;
use scanhive_shared::queue::ScanQueue;
use scanhive_shared::registry::ScannerRegistry;
use scanhive_shared::store::{KvStore, RedisStore, RedisStoreConfig};
use scanhive_shared::tasks::TaskStore;
use scanhive_worker::dispatch::{ScanDispatcher, WorkerConfig};
use scanhive_worker::housekeeper::TtlHousekeeper;
use scanhive_worker::reaper::HeartbeatReaper;
use scanhive_worker::scanner::MockConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanhive_worker=info,scanhive_shared=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("scanhive worker v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let store: Arc<dyn KvStore> =
        Arc::new(RedisStore::connect(RedisStoreConfig::from_env()?).await?);

    let tasks = TaskStore::new(store.clone());
    let queue = ScanQueue::new(store.clone(), config.max_queue_depth);
    let registry = Arc::new(ScannerRegistry::new(config.scanners.clone())?);

    // Backend adapters plug in here; the mock connector keeps a worker
    // runnable without a live scanner.
    let connector = Arc::new(MockConnector::new());

    let dispatcher = Arc::new(ScanDispatcher::new(
        tasks.clone(),
        queue.clone(),
        registry,
        connector,
        WorkerConfig::from_config(&config),
    ));
    let reaper = Arc::new(HeartbeatReaper::new(
        tasks.clone(),
        queue.clone(),
        config.poll_interval(),
    ));
    let housekeeper = Arc::new(TtlHousekeeper::new(tasks, store, &config));

    let shutdown = dispatcher.shutdown_token();

    let dispatch_handle = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };
    let reaper_handle = {
        let reaper = reaper.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { reaper.run(token).await })
    };
    let housekeeper_handle = {
        let housekeeper = housekeeper.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { housekeeper.run(token).await })
    };

    tracing::info!("Worker ready, waiting for tasks");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining");
    shutdown.cancel();

    let (dispatch_result, _, _) =
        futures::join!(dispatch_handle, reaper_handle, housekeeper_handle);
    dispatch_result??;

    tracing::info!("Worker exited cleanly");
    Ok(())
}
