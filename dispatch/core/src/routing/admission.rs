//! Admission Control
//!
//! Bounds how many calls may run at once, and how fast they may start, per
//! scope. Scopes nest:
//!
//! ```text
//! Global ⊇ Group:fast_group ⊇ Model:modelA
//! ```
//!
//! A permit for `Model:modelA` in `fast_group` holds capacity at every
//! configured enclosing scope. Acquisition is all-or-nothing: capacity is
//! taken with non-blocking attempts across the whole chain, and when one scope
//! is saturated everything already taken is dropped before waiting on that
//! scope alone. A waiter never sits on partial capacity, so two dispatches
//! can't deadlock each other across scopes.
//!
//! # Limits
//!
//! - **Concurrency**: a tokio `Semaphore` per scope. Waiters are served in
//!   FIFO order and `try_acquire` never jumps the queue.
//! - **Rate**: a token bucket per scope (rate + burst).
//!
//! Scopes without limits are not tracked at all.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::config::{AdmissionConfig, ScopeLimits};

// ============================================================================
// Scopes
// ============================================================================

/// What a permit is requested for
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AdmissionScope {
    /// Global capacity only
    Global,
    /// A task group or polling pool
    Group(String),
    /// A model, optionally inside a group or pool
    Model {
        group: Option<String>,
        model: String,
    },
}

impl AdmissionScope {
    /// Group scope
    pub fn group(name: impl Into<String>) -> Self {
        Self::Group(name.into())
    }

    /// Model scope outside any group
    pub fn model(model: impl Into<String>) -> Self {
        Self::Model {
            group: None,
            model: model.into(),
        }
    }

    /// Model scope inside a group
    pub fn model_in(group: impl Into<String>, model: impl Into<String>) -> Self {
        Self::Model {
            group: Some(group.into()),
            model: model.into(),
        }
    }

    /// The innermost scope key
    #[must_use]
    pub fn key(&self) -> ScopeKey {
        match self {
            Self::Global => ScopeKey::Global,
            Self::Group(group) => ScopeKey::Group(group.clone()),
            Self::Model { model, .. } => ScopeKey::Model(model.clone()),
        }
    }

    /// Every scope key this scope holds capacity in, outermost first
    #[must_use]
    pub fn chain(&self) -> Vec<ScopeKey> {
        match self {
            Self::Global => vec![ScopeKey::Global],
            Self::Group(group) => vec![ScopeKey::Global, ScopeKey::Group(group.clone())],
            Self::Model { group, model } => {
                let mut chain = vec![ScopeKey::Global];
                if let Some(group) = group {
                    chain.push(ScopeKey::Group(group.clone()));
                }
                chain.push(ScopeKey::Model(model.clone()));
                chain
            }
        }
    }
}

impl fmt::Display for AdmissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model {
                group: Some(group),
                model,
            } => write!(f, "group:{group}/model:{model}"),
            other => write!(f, "{}", other.key()),
        }
    }
}

/// A single limiter key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Global,
    Group(String),
    Model(String),
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Group(name) => write!(f, "group:{name}"),
            Self::Model(name) => write!(f, "model:{name}"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Admission failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// No permit became available in time
    #[error("timed out after {waited:?} waiting for admission to {scope}")]
    Timeout { scope: String, waited: Duration },

    /// The controller was shut down
    #[error("admission to {scope} is closed")]
    Closed { scope: String },
}

impl AdmissionError {
    /// Whether this is a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Stand-in horizon for waits too long for `Instant` to represent
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + timeout`, saturating to a far deadline instead of overflowing
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

// ============================================================================
// Token Bucket
// ============================================================================

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter for a single scope
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        // A bucket that cannot refill hands out its burst and then waits forever
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 0.0 };
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or report how long until one is available
    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::try_from_secs_f64((1.0 - state.tokens) / self.rate)
                .unwrap_or(Duration::MAX))
        }
    }

    fn refund(&self) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + 1.0).min(self.burst);
    }

    fn available(&self) -> f64 {
        self.state.lock().tokens
    }
}

// ============================================================================
// Scope Limiter
// ============================================================================

#[derive(Debug, Default)]
struct ScopeStatsAtomic {
    outstanding: AtomicUsize,
    peak: AtomicUsize,
    acquires: AtomicU64,
    timeouts: AtomicU64,
    waiters: AtomicUsize,
}

/// Decrements the waiter count however the wait ends
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct ScopeLimiter {
    key: ScopeKey,
    generation: u64,
    capacity: Option<usize>,
    semaphore: Option<Arc<Semaphore>>,
    bucket: Option<TokenBucket>,
    stats: ScopeStatsAtomic,
}

impl ScopeLimiter {
    fn new(key: ScopeKey, limits: &ScopeLimits, generation: u64) -> Self {
        let semaphore = limits
            .max_concurrent
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let bucket = limits.requests_per_second.map(|rate| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let default_burst = rate.ceil().max(1.0) as u32;
            TokenBucket::new(rate, limits.burst_size.unwrap_or(default_burst))
        });

        Self {
            key,
            generation,
            capacity: limits.max_concurrent,
            semaphore,
            bucket,
            stats: ScopeStatsAtomic::default(),
        }
    }

    /// Wake waiters so they re-resolve against newer limits
    fn retire(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.close();
        }
    }

    fn on_acquired(&self) {
        self.stats.acquires.fetch_add(1, Ordering::Relaxed);
        let outstanding = self.stats.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.peak.fetch_max(outstanding, Ordering::AcqRel);
    }

    fn snapshot(&self) -> ScopeStats {
        ScopeStats {
            scope: self.key.clone(),
            capacity: self.capacity,
            available: self.semaphore.as_ref().map(|s| s.available_permits()),
            requests_per_second: self.bucket.as_ref().map(|b| b.rate),
            tokens: self.bucket.as_ref().map(TokenBucket::available),
            outstanding: self.stats.outstanding.load(Ordering::Acquire),
            peak: self.stats.peak.load(Ordering::Acquire),
            acquires: self.stats.acquires.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            waiters: self.stats.waiters.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for one admission scope
#[derive(Clone, Debug, PartialEq)]
pub struct ScopeStats {
    /// The scope
    pub scope: ScopeKey,
    /// Concurrency limit, if any
    pub capacity: Option<usize>,
    /// Free concurrency slots, if limited
    pub available: Option<usize>,
    /// Rate limit, if any
    pub requests_per_second: Option<f64>,
    /// Tokens in the bucket at the last refill, if rate limited
    pub tokens: Option<f64>,
    /// Permits currently held
    pub outstanding: usize,
    /// Highest number of permits held at once
    pub peak: usize,
    /// Successful acquisitions
    pub acquires: u64,
    /// Acquisitions that timed out waiting on this scope
    pub timeouts: u64,
    /// Callers currently waiting on this scope
    pub waiters: usize,
}

// ============================================================================
// Admission Permit
// ============================================================================

struct HeldScope {
    limiter: Arc<ScopeLimiter>,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Capacity held in every enclosing scope of an [`AdmissionScope`]
///
/// Released exactly once: by [`AdmissionPermit::release`],
/// [`AdmissionController::release`], or when dropped.
pub struct AdmissionPermit {
    scope: AdmissionScope,
    acquired_at: DateTime<Utc>,
    held: Vec<HeldScope>,
}

impl AdmissionPermit {
    /// The scope this permit was acquired for
    #[must_use]
    pub fn scope(&self) -> &AdmissionScope {
        &self.scope
    }

    /// When the permit was granted
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Limited scopes this permit holds capacity in, outermost first
    #[must_use]
    pub fn held_scopes(&self) -> Vec<ScopeKey> {
        self.held.iter().map(|h| h.limiter.key.clone()).collect()
    }

    /// Give the capacity back
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("scope", &self.scope)
            .field("acquired_at", &self.acquired_at)
            .field("held", &self.held_scopes())
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        for held in &self.held {
            held.limiter.stats.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        // Semaphore permits return to the limiter they came from as `held` drops
    }
}

// ============================================================================
// Admission Controller
// ============================================================================

struct LimitsSnapshot {
    config: AdmissionConfig,
    generation: u64,
}

enum AcquireAttempt {
    Acquired(Vec<HeldScope>),
    Saturated(usize),
    RateLimited(usize, Duration),
    Closed(usize),
}

/// Scoped permits with blocking, timeout-bound acquisition
pub struct AdmissionController {
    limits: RwLock<Arc<LimitsSnapshot>>,
    limiters: DashMap<ScopeKey, Arc<ScopeLimiter>>,
    closed: AtomicBool,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

impl AdmissionController {
    /// Create a controller with the given limits
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            limits: RwLock::new(Arc::new(LimitsSnapshot {
                config,
                generation: 0,
            })),
            limiters: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Controller without any limits
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Default acquisition timeout from the current limits
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.limits.read().config.acquire_timeout()
    }

    fn limits_for(config: &AdmissionConfig, key: &ScopeKey) -> ScopeLimits {
        match key {
            ScopeKey::Global => config.global.clone(),
            ScopeKey::Group(name) => config.limits_for_group(name).clone(),
            ScopeKey::Model(name) => config.limits_for_model(name).clone(),
        }
    }

    /// Limiter for a key under `snapshot`, created on first use
    fn limiter(&self, snapshot: &LimitsSnapshot, key: &ScopeKey) -> Option<Arc<ScopeLimiter>> {
        let limits = Self::limits_for(&snapshot.config, key);
        if limits.is_unlimited() {
            return None;
        }

        let mut entry = self.limiters.entry(key.clone()).or_insert_with(|| {
            Arc::new(ScopeLimiter::new(key.clone(), &limits, snapshot.generation))
        });
        if entry.generation < snapshot.generation {
            entry.retire();
            *entry = Arc::new(ScopeLimiter::new(key.clone(), &limits, snapshot.generation));
        }
        Some(Arc::clone(&entry))
    }

    /// Limiters for every enclosing scope under one consistent set of limits
    fn resolve(&self, scope: &AdmissionScope) -> (u64, Vec<Arc<ScopeLimiter>>) {
        let snapshot = Arc::clone(&self.limits.read());
        let limiters = scope
            .chain()
            .iter()
            .filter_map(|key| self.limiter(&snapshot, key))
            .collect();
        (snapshot.generation, limiters)
    }

    fn generation(&self) -> u64 {
        self.limits.read().generation
    }

    /// A closed semaphore means shutdown unless the limits moved on since `generation`
    fn is_shut(&self, generation: u64) -> bool {
        self.is_closed() || self.generation() == generation
    }

    /// Take capacity in every limiter without waiting, or report the blocker
    fn try_acquire_all(
        limiters: &[Arc<ScopeLimiter>],
        mut pending: Option<(usize, OwnedSemaphorePermit)>,
    ) -> AcquireAttempt {
        let mut held = Vec::with_capacity(limiters.len());

        for (index, limiter) in limiters.iter().enumerate() {
            let permit = match (&limiter.semaphore, pending.take()) {
                (None, other) => {
                    pending = other;
                    None
                }
                (Some(_), Some((pending_index, permit))) if pending_index == index => Some(permit),
                (Some(semaphore), other) => {
                    pending = other;
                    match Arc::clone(semaphore).try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(TryAcquireError::NoPermits) => return AcquireAttempt::Saturated(index),
                        Err(TryAcquireError::Closed) => return AcquireAttempt::Closed(index),
                    }
                }
            };
            held.push(HeldScope {
                limiter: Arc::clone(limiter),
                _permit: permit,
            });
        }

        let mut taken: Vec<&TokenBucket> = Vec::new();
        for (index, limiter) in limiters.iter().enumerate() {
            let Some(bucket) = &limiter.bucket else {
                continue;
            };
            match bucket.try_take() {
                Ok(()) => taken.push(bucket),
                Err(wait) => {
                    for bucket in taken {
                        bucket.refund();
                    }
                    return AcquireAttempt::RateLimited(index, wait);
                }
            }
        }

        AcquireAttempt::Acquired(held)
    }

    /// Acquire capacity for `scope`, waiting up to `timeout`
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if capacity did not free up in time and `Closed` once
    /// the controller has been shut down.
    pub async fn acquire(
        &self,
        scope: &AdmissionScope,
        timeout: Duration,
    ) -> Result<AdmissionPermit, AdmissionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::Closed {
                scope: scope.to_string(),
            });
        }

        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let (mut generation, mut limiters) = self.resolve(scope);

        let mut pending = None;
        loop {
            match Self::try_acquire_all(&limiters, pending.take()) {
                AcquireAttempt::Acquired(held) => {
                    for h in &held {
                        h.limiter.on_acquired();
                    }
                    tracing::debug!(
                        scope = %scope,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Admission granted"
                    );
                    return Ok(AdmissionPermit {
                        scope: scope.clone(),
                        acquired_at: Utc::now(),
                        held,
                    });
                }
                AcquireAttempt::Saturated(index) => {
                    let limiter = Arc::clone(&limiters[index]);
                    let Some(semaphore) = limiter.semaphore.clone() else {
                        continue;
                    };

                    let waiting = WaitGuard::enter(&limiter.stats.waiters);
                    let result = tokio::time::timeout_at(deadline, semaphore.acquire_owned()).await;
                    drop(waiting);

                    match result {
                        // Held only while the rest are tried without waiting
                        Ok(Ok(permit)) => pending = Some((index, permit)),
                        Ok(Err(_)) if self.is_shut(generation) => {
                            return Err(AdmissionError::Closed {
                                scope: limiter.key.to_string(),
                            })
                        }
                        // Retired by `reconfigure`
                        Ok(Err(_)) => {}
                        Err(_) => return Err(Self::timed_out(&limiter, started)),
                    }
                }
                AcquireAttempt::RateLimited(index, wait) => {
                    let limiter = &limiters[index];
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Self::timed_out(limiter, started));
                    }

                    // Token bucket refill wait; nothing is held here
                    let refill_at = now.checked_add(wait).map_or(deadline, |at| at.min(deadline));
                    let waiting = WaitGuard::enter(&limiter.stats.waiters);
                    tokio::time::sleep_until(refill_at).await;
                    drop(waiting);
                }
                AcquireAttempt::Closed(index) => {
                    if self.is_shut(generation) {
                        return Err(AdmissionError::Closed {
                            scope: limiters[index].key.to_string(),
                        });
                    }
                }
            }

            // Limits were swapped while waiting: start over on the new limiters
            if self.generation() != generation {
                pending = None;
                (generation, limiters) = self.resolve(scope);
            }
        }
    }

    fn timed_out(limiter: &ScopeLimiter, started: Instant) -> AdmissionError {
        limiter.stats.timeouts.fetch_add(1, Ordering::Relaxed);
        let waited = started.elapsed();
        tracing::warn!(
            scope = %limiter.key,
            waited_ms = waited.as_millis() as u64,
            "Admission timed out"
        );
        AdmissionError::Timeout {
            scope: limiter.key.to_string(),
            waited,
        }
    }

    /// Acquire with the configured default timeout
    ///
    /// # Errors
    ///
    /// See [`AdmissionController::acquire`].
    pub async fn acquire_default(
        &self,
        scope: &AdmissionScope,
    ) -> Result<AdmissionPermit, AdmissionError> {
        self.acquire(scope, self.default_timeout()).await
    }

    /// Give a permit back
    pub fn release(&self, permit: AdmissionPermit) {
        tracing::trace!(scope = %permit.scope(), "Admission released");
        permit.release();
    }

    /// Swap in new limits
    ///
    /// New acquisitions use the new limits immediately. Outstanding permits
    /// release into the limiter they were taken from.
    pub fn reconfigure(&self, config: AdmissionConfig) {
        let generation = {
            let mut limits = self.limits.write();
            let generation = limits.generation + 1;
            *limits = Arc::new(LimitsSnapshot { config, generation });
            generation
        };
        self.limiters.retain(|_, limiter| {
            let current = limiter.generation >= generation;
            if !current {
                limiter.retire();
            }
            current
        });
        tracing::info!(generation, "Admission limits reconfigured");
    }

    /// Reject new acquisitions and wake every waiter with `Closed`
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for limiter in &self.limiters {
            if let Some(semaphore) = &limiter.semaphore {
                semaphore.close();
            }
        }
        tracing::info!("Admission controller closed");
    }

    /// Whether [`AdmissionController::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Statistics for one scope, if it is limited and has been used
    #[must_use]
    pub fn scope_stats(&self, key: &ScopeKey) -> Option<ScopeStats> {
        self.limiters.get(key).map(|l| l.snapshot())
    }

    /// Statistics for every tracked scope, sorted by scope
    #[must_use]
    pub fn stats(&self) -> Vec<ScopeStats> {
        let mut stats: Vec<ScopeStats> = self.limiters.iter().map(|l| l.snapshot()).collect();
        stats.sort_by(|a, b| a.scope.cmp(&b.scope));
        stats
    }
}
