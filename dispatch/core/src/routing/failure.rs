//! Failure Tracking
//!
//! Per-target failure counters with the timestamp of the most recent failure.
//! A failure increments the count, a success clears the record.
//!
//! Counts never decay with time: a target that failed long ago and is tried
//! again still carries its old count until it succeeds.
//!
//! # Thread Safety
//!
//! Records live in a `DashMap`, so updates to different targets only contend
//! when they hash to the same shard and no lock outlives a single call.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Failure state of one target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    /// Failures since the last success
    pub count: u32,
    /// When the most recent failure happened
    pub last_failure: DateTime<Utc>,
}

/// Sharded per-target failure counters
#[derive(Debug, Default)]
pub struct FailureTracker {
    records: DashMap<String, FailureRecord>,
}

impl FailureTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the new count
    pub fn record_failure(&self, target: &str) -> u32 {
        let now = Utc::now();
        let mut entry = self
            .records
            .entry(target.to_string())
            .or_insert(FailureRecord {
                count: 0,
                last_failure: now,
            });
        entry.count = entry.count.saturating_add(1);
        entry.last_failure = now;
        let count = entry.count;
        drop(entry);

        tracing::debug!(target_id = %target, count, "Recorded failure");
        count
    }

    /// Clear a target's record
    pub fn record_success(&self, target: &str) {
        if self.records.remove(target).is_some() {
            tracing::debug!(target_id = %target, "Cleared failure record");
        }
    }

    /// Failures since the last success (0 if unknown)
    #[must_use]
    pub fn count(&self, target: &str) -> u32 {
        self.records.get(target).map_or(0, |r| r.count)
    }

    /// Full record for a target
    #[must_use]
    pub fn get(&self, target: &str) -> Option<FailureRecord> {
        self.records.get(target).map(|r| *r)
    }

    /// Whether a target has reached `threshold` failures
    #[must_use]
    pub fn is_saturated(&self, target: &str, threshold: u32) -> bool {
        self.count(target) >= threshold
    }

    /// Copy of every record, sorted by target
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, FailureRecord)> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    /// Forget everything
    pub fn reset(&self) {
        self.records.clear();
    }

    /// Number of targets with a record
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no target has a record
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
