//! Dispatch Observers
//!
//! Fire-and-forget hooks for logging and metrics. Observers run inline on the
//! dispatching task, so they must be quick; a panicking observer is caught
//! and logged, and never fails the dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::engine::FallbackExhausted;
use super::session::{FallbackAttempt, FallbackSession};

/// Hooks called by the engine as a dispatch progresses
pub trait DispatchObserver: Send + Sync {
    /// An attempt finished (successfully or not)
    fn on_attempt(&self, _session: &FallbackSession, _attempt: &FallbackAttempt) {}

    /// A dispatch succeeded
    fn on_success(&self, _session: &FallbackSession) {}

    /// A dispatch ran out of attempts or candidates
    fn on_exhausted(&self, _error: &FallbackExhausted) {}
}

/// Emits structured `tracing` events
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl DispatchObserver for TracingObserver {
    fn on_attempt(&self, session: &FallbackSession, attempt: &FallbackAttempt) {
        match &attempt.error {
            None => tracing::debug!(
                session = %session.id(),
                attempt = attempt.attempt,
                model = %attempt.target,
                duration_ms = attempt.duration.as_millis() as u64,
                "Attempt succeeded"
            ),
            Some(error) => tracing::debug!(
                session = %session.id(),
                attempt = attempt.attempt,
                model = %attempt.target,
                delay_ms = attempt.delay.as_millis() as u64,
                error = %error,
                "Attempt failed"
            ),
        }
    }

    fn on_success(&self, session: &FallbackSession) {
        tracing::info!(
            session = %session.id(),
            primary = %session.primary(),
            attempts = session.attempt_count(),
            model = session.last_attempt().map_or("", |a| a.target.model.as_str()),
            "Dispatch succeeded"
        );
    }

    fn on_exhausted(&self, error: &FallbackExhausted) {
        tracing::warn!(
            session = %error.session.id(),
            primary = %error.session.primary(),
            attempts = error.session.attempt_count(),
            last_error = %error.last_error,
            "Dispatch exhausted"
        );
    }
}

/// Call an observer, swallowing any panic
pub(crate) fn notify<F>(observer: &Arc<dyn DispatchObserver>, hook: &'static str, call: F)
where
    F: FnOnce(&dyn DispatchObserver),
{
    let result = catch_unwind(AssertUnwindSafe(|| call(observer.as_ref())));
    if result.is_err() {
        tracing::error!(hook, "Dispatch observer panicked; ignoring");
    }
}
