/// Scanner registry
///
/// Holds the configured scanner instances grouped into pools and accounts
/// for in-flight reservations. Counters live behind one registry-local
/// mutex; the lock is held only for the selection arithmetic, never across
/// I/O.
///
/// # Selection
///
/// `reserve` picks, among enabled instances of the pool with spare
/// capacity, the one with the lowest `active_scans`; ties break on the
/// lexically lowest instance key, so selection is deterministic. The
/// instance map is a `BTreeMap`, which makes the tie-break fall out of
/// iteration order.
///
/// # Reload
///
/// `reload` swaps the descriptor set without touching in-flight
/// reservations. An instance that disappears from the new set is retired:
/// it stops being selectable immediately, but stays accounted until its
/// last reservation is released.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::config::ScannerDescriptor;
use crate::error::{CoreError, CoreResult};

/// Point-in-time view of one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_key: String,
    pub scanner_type: String,
    pub pool: String,
    pub url: String,
    pub enabled: bool,
    pub active_scans: u32,
    pub max_concurrent_scans: u32,
}

/// Point-in-time view of one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool: String,
    pub total_scanners: usize,
    pub total_capacity: u32,
    pub total_active: u32,
    pub available_capacity: u32,
    pub utilization_pct: f64,
    pub scanners: Vec<InstanceStatus>,
}

#[derive(Debug)]
struct InstanceState {
    descriptor: ScannerDescriptor,
    active_scans: u32,
    retired: bool,
}

/// Registry of scanner instances with per-instance concurrency caps
#[derive(Debug)]
pub struct ScannerRegistry {
    inner: Mutex<BTreeMap<String, InstanceState>>,
}

impl ScannerRegistry {
    /// Builds a registry from descriptors.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on duplicate instance keys.
    pub fn new(descriptors: Vec<ScannerDescriptor>) -> CoreResult<Self> {
        let mut instances = BTreeMap::new();
        for descriptor in descriptors {
            let key = descriptor.instance_key.clone();
            let state = InstanceState {
                descriptor,
                active_scans: 0,
                retired: false,
            };
            if instances.insert(key.clone(), state).is_some() {
                return Err(CoreError::InvalidArgument(format!(
                    "duplicate instance_key: {}",
                    key
                )));
            }
        }
        Ok(ScannerRegistry {
            inner: Mutex::new(instances),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, InstanceState>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pool names with at least one non-retired instance, sorted.
    pub fn list_pools(&self) -> Vec<String> {
        let inner = self.lock();
        let mut pools: Vec<String> = inner
            .values()
            .filter(|s| !s.retired)
            .map(|s| s.descriptor.pool.clone())
            .collect();
        pools.sort();
        pools.dedup();
        pools
    }

    /// All non-retired instances, sorted by key.
    pub fn list_instances(&self) -> Vec<InstanceStatus> {
        let inner = self.lock();
        inner
            .values()
            .filter(|s| !s.retired)
            .map(instance_status)
            .collect()
    }

    /// Capacity summary for one pool.
    ///
    /// The `available_capacity = total_capacity - total_active` invariant
    /// holds by construction.
    pub fn pool_status(&self, pool: &str) -> CoreResult<PoolStatus> {
        let inner = self.lock();
        let scanners: Vec<InstanceStatus> = inner
            .values()
            .filter(|s| !s.retired && s.descriptor.pool == pool)
            .map(instance_status)
            .collect();
        if scanners.is_empty() {
            return Err(CoreError::NotFound(format!("unknown pool: {}", pool)));
        }

        let total_capacity: u32 = scanners.iter().map(|s| s.max_concurrent_scans).sum();
        let total_active: u32 = scanners.iter().map(|s| s.active_scans).sum();
        let utilization_pct = if total_capacity == 0 {
            0.0
        } else {
            (f64::from(total_active) / f64::from(total_capacity)) * 100.0
        };

        Ok(PoolStatus {
            pool: pool.to_string(),
            total_scanners: scanners.len(),
            total_capacity,
            total_active,
            available_capacity: total_capacity - total_active,
            utilization_pct,
            scanners,
        })
    }

    /// Reserves capacity on the least-loaded enabled instance of `pool`.
    ///
    /// Returns the instance key, or None when the pool has no spare
    /// capacity — the caller re-queues or waits.
    pub fn reserve(&self, pool: &str) -> Option<String> {
        let mut inner = self.lock();
        let key = inner
            .values()
            .filter(|s| {
                !s.retired
                    && s.descriptor.enabled
                    && s.descriptor.pool == pool
                    && s.active_scans < s.descriptor.max_concurrent_scans
            })
            // Equal loads break on the lexically lowest key. Instance keys
            // are unique, so the (load, key) pair has a single minimum and
            // min_by_key's first-of-equal-minima rule never comes into play.
            .min_by_key(|s| (s.active_scans, s.descriptor.instance_key.clone()))
            .map(|s| s.descriptor.instance_key.clone())?;

        let state = inner.get_mut(&key).expect("selected key exists");
        state.active_scans += 1;
        tracing::debug!(
            instance_key = %key,
            pool = %pool,
            active_scans = state.active_scans,
            "Reserved scanner instance"
        );
        Some(key)
    }

    /// Releases one reservation. Retired instances are dropped once their
    /// last reservation returns.
    pub fn release(&self, instance_key: &str) {
        let mut inner = self.lock();
        let Some(state) = inner.get_mut(instance_key) else {
            tracing::warn!(instance_key = %instance_key, "Release for unknown instance");
            return;
        };
        if state.active_scans == 0 {
            tracing::warn!(instance_key = %instance_key, "Release without reservation");
            return;
        }
        state.active_scans -= 1;
        tracing::debug!(
            instance_key = %instance_key,
            active_scans = state.active_scans,
            "Released scanner instance"
        );
        if state.retired && state.active_scans == 0 {
            inner.remove(instance_key);
        }
    }

    /// Descriptor for an instance, if it is still known (retired included —
    /// a worker holding a reservation must still be able to reach it).
    pub fn descriptor(&self, instance_key: &str) -> Option<ScannerDescriptor> {
        let inner = self.lock();
        inner.get(instance_key).map(|s| s.descriptor.clone())
    }

    /// Swaps the descriptor set.
    ///
    /// Existing instances get their descriptors updated in place (counters
    /// kept); instances absent from the new set are retired; new instances
    /// start idle.
    pub fn reload(&self, descriptors: Vec<ScannerDescriptor>) -> CoreResult<()> {
        let mut incoming: BTreeMap<String, ScannerDescriptor> = BTreeMap::new();
        for descriptor in descriptors {
            if incoming
                .insert(descriptor.instance_key.clone(), descriptor)
                .is_some()
            {
                return Err(CoreError::InvalidArgument(
                    "duplicate instance_key in reload".to_string(),
                ));
            }
        }

        let mut inner = self.lock();
        let existing_keys: Vec<String> = inner.keys().cloned().collect();
        for key in existing_keys {
            match incoming.remove(&key) {
                Some(descriptor) => {
                    let state = inner.get_mut(&key).expect("key exists");
                    state.descriptor = descriptor;
                    state.retired = false;
                }
                None => {
                    let state = inner.get_mut(&key).expect("key exists");
                    if state.active_scans == 0 {
                        inner.remove(&key);
                    } else {
                        state.retired = true;
                        tracing::info!(
                            instance_key = %key,
                            active_scans = state.active_scans,
                            "Instance retired, draining reservations"
                        );
                    }
                }
            }
        }
        for (key, descriptor) in incoming {
            inner.insert(
                key,
                InstanceState {
                    descriptor,
                    active_scans: 0,
                    retired: false,
                },
            );
        }
        Ok(())
    }
}

fn instance_status(state: &InstanceState) -> InstanceStatus {
    InstanceStatus {
        instance_key: state.descriptor.instance_key.clone(),
        scanner_type: state.descriptor.scanner_type.clone(),
        pool: state.descriptor.pool.clone(),
        url: state.descriptor.url.clone(),
        enabled: state.descriptor.enabled,
        active_scans: state.active_scans,
        max_concurrent_scans: state.descriptor.max_concurrent_scans,
    }
}
