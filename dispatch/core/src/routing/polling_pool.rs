//! Polling Pool Management
//!
//! Flat, round-robin rotated sets of interchangeable model instances. From the
//! engine's point of view a pool is one opaque retry unit: every attempt asks
//! the pool for its next instance.
//!
//! # Lifecycle
//!
//! ```text
//!   Open ──shutdown(grace)──> Draining ──in-flight == 0 or grace elapsed──> Closed
//! ```
//!
//! `next()` fails fast with `PoolClosed` once the pool leaves `Open`. Each
//! instance handed out is wrapped in a [`PoolLease`] so draining can wait for
//! calls that are still running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Notify;

use super::admission::deadline_after;
use crate::config::PoolConfig;

// ============================================================================
// Pool Types
// ============================================================================

/// Lifecycle state of a pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// Handing out instances
    Open,
    /// Rejecting new leases, waiting for in-flight ones
    Draining,
    /// Rejecting everything
    Closed,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Draining => 1,
            Self::Closed => 2,
        }
    }
}

/// Statistics for a polling pool
#[derive(Clone, Debug)]
pub struct PoolStats {
    /// Pool name
    pub name: String,
    /// Current state
    pub state: PoolState,
    /// Number of instances
    pub instances: usize,
    /// Leases handed out
    pub rotations: u64,
    /// Leases currently outstanding
    pub in_flight: usize,
    /// `next()` calls rejected because the pool was not open
    pub rejected: u64,
}

/// Pool errors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// Pool is draining or closed
    PoolClosed(String),
    /// Pool has no instances
    Empty(String),
    /// No pool with this name
    NotFound(String),
    /// A pool with this name already exists
    AlreadyExists(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoolClosed(name) => write!(f, "Polling pool '{name}' is closed"),
            Self::Empty(name) => write!(f, "Polling pool '{name}' has no instances"),
            Self::NotFound(name) => write!(f, "Polling pool '{name}' not found"),
            Self::AlreadyExists(name) => write!(f, "Polling pool '{name}' already exists"),
        }
    }
}

impl std::error::Error for PoolError {}

// ============================================================================
// Polling Pool
// ============================================================================

/// A round-robin pool of interchangeable instances
#[derive(Debug)]
pub struct PollingPool {
    name: String,
    instances: Vec<String>,
    cursor: AtomicUsize,
    state: AtomicU8,
    in_flight: AtomicUsize,
    drained: Notify,
    rotations: AtomicU64,
    rejected: AtomicU64,
}

impl PollingPool {
    /// Create an open pool
    pub fn new(name: impl Into<String>, instances: Vec<String>) -> Self {
        Self {
            name: name.into(),
            instances,
            cursor: AtomicUsize::new(0),
            state: AtomicU8::new(PoolState::Open.as_u8()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            rotations: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instances in rotation order
    #[must_use]
    pub fn instances(&self) -> &[String] {
        &self.instances
    }

    /// Number of instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the pool has no instances
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Lease the next instance in rotation
    ///
    /// Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `PoolClosed` once shutdown has begun and `Empty` for a pool
    /// without instances.
    pub fn next(self: &Arc<Self>) -> Result<PoolLease, PoolError> {
        // Count the lease before checking state so shutdown cannot miss it
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        if self.state() != PoolState::Open {
            self.release_in_flight();
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::PoolClosed(self.name.clone()));
        }

        let len = self.instances.len();
        if len == 0 {
            self.release_in_flight();
            return Err(PoolError::Empty(self.name.clone()));
        }

        let index = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
        {
            Ok(previous) | Err(previous) => previous % len,
        };
        self.rotations.fetch_add(1, Ordering::Relaxed);

        Ok(PoolLease {
            pool: Arc::clone(self),
            instance: self.instances[index].clone(),
        })
    }

    fn release_in_flight(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Stop handing out leases and wait up to `grace` for in-flight ones
    ///
    /// Idempotent. Returns the number of leases still outstanding when the
    /// pool was force-closed (0 for a clean drain).
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let previous = self.state.compare_exchange(
            PoolState::Open.as_u8(),
            PoolState::Draining.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match previous {
            Ok(_) => tracing::info!(
                pool = %self.name,
                grace_ms = grace.as_millis() as u64,
                "Draining polling pool"
            ),
            Err(state) if PoolState::from_u8(state) == PoolState::Closed => return 0,
            Err(_) => {}
        }

        let deadline = deadline_after(tokio::time::Instant::now(), grace);
        let outstanding = loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let in_flight = self.in_flight.load(Ordering::SeqCst);
            if in_flight == 0 {
                break 0;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break self.in_flight.load(Ordering::SeqCst);
            }
        };

        self.state.store(PoolState::Closed.as_u8(), Ordering::SeqCst);
        if outstanding > 0 {
            tracing::warn!(
                pool = %self.name,
                outstanding,
                "Polling pool force-closed with leases in flight"
            );
        } else {
            tracing::info!(pool = %self.name, "Polling pool closed");
        }
        outstanding
    }

    /// Get a statistics snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            state: self.state(),
            instances: self.instances.len(),
            rotations: self.rotations.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// An instance handed out by [`PollingPool::next`]
///
/// Counts as in flight until dropped.
#[derive(Debug)]
pub struct PoolLease {
    pool: Arc<PollingPool>,
    instance: String,
}

impl PoolLease {
    /// The leased instance id
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Name of the pool the lease came from
    #[must_use]
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.release_in_flight();
    }
}

// ============================================================================
// Pool Manager
// ============================================================================

/// Registry of polling pools
#[derive(Debug, Default)]
pub struct PoolManager {
    pools: DashMap<String, Arc<PollingPool>>,
}

impl PoolManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager holding the configured pools
    #[must_use]
    pub fn from_config(pools: &[PoolConfig]) -> Self {
        let manager = Self::new();
        for pool in pools {
            manager.pools.insert(
                pool.name.clone(),
                Arc::new(PollingPool::new(pool.name.clone(), pool.instances.clone())),
            );
        }
        manager
    }

    /// Create a pool explicitly
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken.
    pub fn create(
        &self,
        name: impl Into<String>,
        instances: Vec<String>,
    ) -> Result<Arc<PollingPool>, PoolError> {
        let name = name.into();
        match self.pools.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PoolError::AlreadyExists(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let pool = Arc::new(PollingPool::new(name, instances));
                slot.insert(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    /// Look up a pool
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no pool has this name.
    pub fn get(&self, name: &str) -> Result<Arc<PollingPool>, PoolError> {
        self.pools
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| PoolError::NotFound(name.to_string()))
    }

    /// Look up a pool, creating it on first use
    pub fn get_or_create(&self, name: &str, instances: Vec<String>) -> Arc<PollingPool> {
        let entry = self
            .pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PollingPool::new(name, instances)));
        Arc::clone(entry.value())
    }

    /// Whether a pool with this name exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Pool names, sorted
    #[must_use]
    pub fn list_pools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// Statistics for every pool
    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|p| (p.key().clone(), p.value().stats()))
            .collect()
    }

    /// Replace pool membership
    ///
    /// Pools whose instances are unchanged keep their rotation state. Changed
    /// or removed pools leave the registry; dispatches already holding them
    /// finish against the old instance list.
    pub fn reload(&self, pools: &[PoolConfig]) {
        let wanted: HashMap<&str, &PoolConfig> =
            pools.iter().map(|p| (p.name.as_str(), p)).collect();

        self.pools.retain(|name, pool| {
            wanted
                .get(name.as_str())
                .is_some_and(|cfg| {
                    cfg.instances == pool.instances && pool.state() == PoolState::Open
                })
        });

        for pool in pools {
            self.pools.entry(pool.name.clone()).or_insert_with(|| {
                Arc::new(PollingPool::new(pool.name.clone(), pool.instances.clone()))
            });
        }
    }

    /// Drain every pool concurrently
    ///
    /// Idempotent. Returns the total number of leases force-closed.
    pub async fn shutdown_all(&self, grace: Duration) -> usize {
        let pools: Vec<Arc<PollingPool>> =
            self.pools.iter().map(|p| Arc::clone(p.value())).collect();

        join_all(pools.iter().map(|pool| pool.shutdown(grace)))
            .await
            .into_iter()
            .sum()
    }
}
