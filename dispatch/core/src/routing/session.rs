//! Fallback Sessions and Statistics
//!
//! A [`FallbackSession`] is the attempt history and outcome of one logical
//! dispatch. The engine owns it while the attempt loop runs, seals it exactly
//! once, then hands it read-only (`Arc`) to the [`SessionTracker`].
//!
//! # Statistics
//!
//! The tracker keeps a bounded FIFO of sessions. Aggregate counters are
//! adjusted when a session is recorded and again when it is evicted, so
//! statistics always describe the retained window and recording is O(1) in
//! the number of retained sessions.
//!
//! ```text
//! record(session)
//!     │
//!     ├─ buffer.push_back        (single writer, mutex)
//!     ├─ counters += session     (atomics under a sequence counter / DashMap)
//!     └─ if over capacity:
//!           buffer.pop_front
//!           counters -= evicted
//! ```
//!
//! Readers never lock: they retry until the sequence counter is even and
//! unchanged around their loads, so rates are never computed from a
//! half-applied session.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::engine::AttemptError;
use super::strategy::RouteTarget;
use crate::backend::ModelResponse;

// ============================================================================
// Attempts
// ============================================================================

/// One call (or attempted call) made during a dispatch
#[derive(Clone, Debug)]
pub struct FallbackAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// What was called
    pub target: RouteTarget,
    /// Why it failed, if it did
    pub error: Option<AttemptError>,
    /// Whether the call succeeded
    pub success: bool,
    /// Backoff slept before this attempt
    pub delay: Duration,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// How long the attempt took (admission wait included)
    pub duration: Duration,
    /// The response, for a successful attempt
    pub response: Option<ModelResponse>,
}

impl FallbackAttempt {
    /// A successful attempt
    #[must_use]
    pub fn succeeded(
        attempt: u32,
        target: RouteTarget,
        delay: Duration,
        started_at: DateTime<Utc>,
        duration: Duration,
        response: ModelResponse,
    ) -> Self {
        Self {
            attempt,
            target,
            error: None,
            success: true,
            delay,
            started_at,
            duration,
            response: Some(response),
        }
    }

    /// A failed attempt
    #[must_use]
    pub fn failed(
        attempt: u32,
        target: RouteTarget,
        delay: Duration,
        started_at: DateTime<Utc>,
        duration: Duration,
        error: AttemptError,
    ) -> Self {
        Self {
            attempt,
            target,
            error: Some(error),
            success: false,
            delay,
            started_at,
            duration,
            response: None,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// How a session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Not sealed yet
    Pending,
    /// An attempt succeeded
    Succeeded,
    /// The attempt budget or the candidates ran out
    Failed,
    /// The caller cancelled the dispatch
    Cancelled,
}

/// The attempt history and outcome of one dispatch
#[derive(Clone, Debug)]
pub struct FallbackSession {
    id: Uuid,
    primary: String,
    strategy: &'static str,
    started_at: DateTime<Utc>,
    started: tokio::time::Instant,
    ended_at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    attempts: Vec<FallbackAttempt>,
    outcome: SessionOutcome,
    final_error: Option<AttemptError>,
}

impl FallbackSession {
    /// Open a session for `primary`
    pub fn new(primary: impl Into<String>, strategy: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            primary: primary.into(),
            strategy,
            started_at: Utc::now(),
            started: tokio::time::Instant::now(),
            ended_at: None,
            duration: None,
            attempts: Vec::new(),
            outcome: SessionOutcome::Pending,
            final_error: None,
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// What the caller asked for
    #[must_use]
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Name of the routing strategy that drove the session
    #[must_use]
    pub fn strategy(&self) -> &'static str {
        self.strategy
    }

    /// When the session opened
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the session was sealed
    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Wall time from open to seal
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Attempts in the order they were recorded
    #[must_use]
    pub fn attempts(&self) -> &[FallbackAttempt] {
        &self.attempts
    }

    /// Number of attempts
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// The most recent attempt
    #[must_use]
    pub fn last_attempt(&self) -> Option<&FallbackAttempt> {
        self.attempts.last()
    }

    /// How the session ended
    #[must_use]
    pub fn outcome(&self) -> SessionOutcome {
        self.outcome
    }

    /// Whether the session ended in success
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome == SessionOutcome::Succeeded
    }

    /// Whether the session has been sealed
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.outcome != SessionOutcome::Pending
    }

    /// The error that ended an unsuccessful session
    #[must_use]
    pub fn final_error(&self) -> Option<&AttemptError> {
        self.final_error.as_ref()
    }

    /// Whether the dispatch needed more than one attempt
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.attempts.len() > 1
    }

    pub(crate) fn next_attempt_number(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX).saturating_add(1)
    }

    pub(crate) fn push_attempt(&mut self, attempt: FallbackAttempt) {
        if self.is_sealed() {
            tracing::warn!(session = %self.id, "Ignoring attempt recorded after seal");
            return;
        }
        self.attempts.push(attempt);
    }

    /// Seal the session; later calls are ignored
    pub(crate) fn seal(&mut self, outcome: SessionOutcome, final_error: Option<AttemptError>) {
        if self.is_sealed() || outcome == SessionOutcome::Pending {
            return;
        }
        self.outcome = outcome;
        self.final_error = final_error;
        self.ended_at = Some(Utc::now());
        self.duration = Some(self.started.elapsed());
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-target counters over the retained window
#[derive(Clone, Debug, PartialEq)]
pub struct TargetStats {
    /// Model id
    pub target: String,
    /// Attempts made against the target
    pub attempts: u64,
    /// Attempts that succeeded
    pub successes: u64,
    /// `successes / attempts`
    pub hit_rate: f64,
}

/// Aggregate statistics over the retained sessions
#[derive(Clone, Debug, PartialEq)]
pub struct SessionStats {
    /// Sessions currently retained
    pub total_sessions: u64,
    /// Retained sessions that succeeded
    pub successful_sessions: u64,
    /// `successful_sessions / total_sessions`
    pub success_rate: f64,
    /// Mean attempts per session
    pub average_attempts: f64,
    /// Share of sessions that needed more than one attempt
    pub fallback_usage_rate: f64,
    /// Mean session duration
    pub average_duration_ms: f64,
    /// Most frequent attempt error kinds, most frequent first
    pub top_error_types: Vec<(String, u64)>,
    /// Most attempted targets, most attempted first
    pub top_targets: Vec<TargetStats>,
    /// Sessions dropped from the window so far
    pub evicted_sessions: u64,
}

/// Consistent read of the aggregate counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Totals {
    total: u64,
    successes: u64,
    attempts: u64,
    with_fallback: u64,
    duration_ms: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct TargetCounters {
    attempts: u64,
    successes: u64,
}

// ============================================================================
// Session Tracker
// ============================================================================

/// Bounded history of sealed sessions with incremental statistics
#[derive(Debug)]
pub struct SessionTracker {
    capacity: AtomicUsize,
    top_n: usize,
    buffer: Mutex<VecDeque<Arc<FallbackSession>>>,
    /// Odd while a writer is mid-update
    sequence: AtomicU64,
    total: AtomicU64,
    successes: AtomicU64,
    attempts: AtomicU64,
    with_fallback: AtomicU64,
    duration_ms: AtomicU64,
    evicted: AtomicU64,
    error_types: DashMap<String, u64>,
    targets: DashMap<String, TargetCounters>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl SessionTracker {
    /// How many entries the `top_*` lists hold
    pub const DEFAULT_TOP_N: usize = 5;

    /// Create a tracker retaining at most `max_sessions`
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(max_sessions.max(1)),
            top_n: Self::DEFAULT_TOP_N,
            buffer: Mutex::new(VecDeque::new()),
            sequence: AtomicU64::new(0),
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            with_fallback: AtomicU64::new(0),
            duration_ms: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            error_types: DashMap::new(),
            targets: DashMap::new(),
        }
    }

    /// Change the number of entries in the `top_*` lists
    #[must_use]
    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// Retention limit
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Record a sealed session
    ///
    /// Unsealed sessions are ignored.
    pub fn record(&self, session: Arc<FallbackSession>) {
        if !session.is_sealed() {
            tracing::warn!(session = %session.id(), "Refusing to record an unsealed session");
            return;
        }

        let mut buffer = self.buffer.lock();
        let capacity = self.capacity();
        self.write_totals(|| {
            self.apply(&session, true);
            buffer.push_back(session);
            self.evict_over(&mut buffer, capacity);
        });
    }

    /// Change the retention limit, evicting the oldest sessions if needed
    pub fn set_capacity(&self, max_sessions: usize) {
        let max_sessions = max_sessions.max(1);
        let mut buffer = self.buffer.lock();
        self.capacity.store(max_sessions, Ordering::Relaxed);
        self.write_totals(|| self.evict_over(&mut buffer, max_sessions));
    }

    fn evict_over(&self, buffer: &mut VecDeque<Arc<FallbackSession>>, capacity: usize) {
        while buffer.len() > capacity {
            if let Some(oldest) = buffer.pop_front() {
                self.apply(&oldest, false);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Add (`add = true`) or remove a session's contribution to the counters
    ///
    /// Callers hold the buffer lock inside [`Self::write_totals`], so there is
    /// a single writer and readers see whole records and evictions.
    fn apply(&self, session: &FallbackSession, add: bool) {
        let bump = |counter: &AtomicU64, by: u64| {
            if add {
                counter.fetch_add(by, Ordering::Relaxed);
            } else {
                counter.fetch_sub(by, Ordering::Relaxed);
            }
        };

        bump(&self.total, 1);
        if session.succeeded() {
            bump(&self.successes, 1);
        }
        bump(&self.attempts, session.attempt_count() as u64);
        if session.used_fallback() {
            bump(&self.with_fallback, 1);
        }
        let duration_ms = session.duration().map_or(0, |d| d.as_millis() as u64);
        bump(&self.duration_ms, duration_ms);

        for attempt in session.attempts() {
            if let Some(error) = &attempt.error {
                adjust(&self.error_types, error.kind_label(), add, |count, add| {
                    if add {
                        *count += 1;
                    } else {
                        *count = count.saturating_sub(1);
                    }
                    *count == 0
                });
            }

            adjust(&self.targets, &attempt.target.model, add, |counters, add| {
                let success = u64::from(attempt.success);
                if add {
                    counters.attempts += 1;
                    counters.successes += success;
                } else {
                    counters.attempts = counters.attempts.saturating_sub(1);
                    counters.successes = counters.successes.saturating_sub(success);
                }
                counters.attempts == 0
            });
        }
    }

    /// Update the aggregate counters as one unit; callers hold the buffer lock
    fn write_totals(&self, update: impl FnOnce()) {
        self.sequence.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        update();
        self.sequence.fetch_add(1, Ordering::Release);
    }

    /// Read the aggregate counters without tearing across a concurrent update
    fn read_totals(&self) -> Totals {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let totals = Totals {
                total: self.total.load(Ordering::Relaxed),
                successes: self.successes.load(Ordering::Relaxed),
                attempts: self.attempts.load(Ordering::Relaxed),
                with_fallback: self.with_fallback.load(Ordering::Relaxed),
                duration_ms: self.duration_ms.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);
            if self.sequence.load(Ordering::Relaxed) == before {
                return totals;
            }
        }
    }

    /// Aggregate statistics over the retained window
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> SessionStats {
        let totals = self.read_totals();
        let total = totals.total;
        let successes = totals.successes;
        let ratio = |value: u64| {
            if total == 0 {
                0.0
            } else {
                value as f64 / total as f64
            }
        };

        let mut top_error_types: Vec<(String, u64)> = self
            .error_types
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        top_error_types.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_error_types.truncate(self.top_n);

        let mut top_targets: Vec<TargetStats> = self
            .targets
            .iter()
            .map(|t| target_stats(t.key(), *t.value()))
            .collect();
        top_targets.sort_by(|a, b| {
            b.attempts
                .cmp(&a.attempts)
                .then_with(|| a.target.cmp(&b.target))
        });
        top_targets.truncate(self.top_n);

        SessionStats {
            total_sessions: total,
            successful_sessions: successes,
            success_rate: ratio(successes),
            average_attempts: ratio(totals.attempts),
            fallback_usage_rate: ratio(totals.with_fallback),
            average_duration_ms: ratio(totals.duration_ms),
            top_error_types,
            top_targets,
            evicted_sessions: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Counters for one target over the retained window
    #[must_use]
    pub fn target_stats(&self, target: &str) -> Option<TargetStats> {
        self.targets.get(target).map(|t| target_stats(target, *t))
    }

    /// The `n` most recent sessions, newest first
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<Arc<FallbackSession>> {
        self.buffer.lock().iter().rev().take(n).cloned().collect()
    }

    /// Find a retained session by id
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<FallbackSession>> {
        self.buffer.lock().iter().find(|s| s.id() == id).cloned()
    }

    /// Number of retained sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether no session is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every retained session and reset the counters
    pub fn clear(&self) {
        let mut buffer = self.buffer.lock();
        buffer.clear();
        self.write_totals(|| {
            for counter in [
                &self.total,
                &self.successes,
                &self.attempts,
                &self.with_fallback,
                &self.duration_ms,
            ] {
                counter.store(0, Ordering::Relaxed);
            }
        });
        self.evicted.store(0, Ordering::Relaxed);
        self.error_types.clear();
        self.targets.clear();
    }
}

/// Update one keyed counter; `update` returns true when the entry is empty
fn adjust<V, F>(map: &DashMap<String, V>, key: &str, add: bool, update: F)
where
    V: Default,
    F: FnOnce(&mut V, bool) -> bool,
{
    let empty = {
        let mut entry = map.entry(key.to_string()).or_default();
        update(entry.value_mut(), add)
    };
    if empty {
        map.remove(key);
    }
}

#[allow(clippy::cast_precision_loss)]
fn target_stats(target: &str, counters: TargetCounters) -> TargetStats {
    TargetStats {
        target: target.to_string(),
        attempts: counters.attempts,
        successes: counters.successes,
        hit_rate: if counters.attempts == 0 {
            0.0
        } else {
            counters.successes as f64 / counters.attempts as f64
        },
    }
}
