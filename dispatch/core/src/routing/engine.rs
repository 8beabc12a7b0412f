//! Fallback Engine
//!
//! Runs the attempt loop for one logical dispatch: pick a target, acquire
//! admission, call the model, and on failure consult the routing strategy,
//! back off and go again until a call succeeds or the budget runs out.
//!
//! # Architecture
//!
//! ```text
//! dispatch("fast_group.echelon1")
//!         |
//!         v
//!   pool name? ──yes──> PollingPool strategy (lease per attempt)
//!         | no
//!         v
//!   GroupReference ──> GroupBased strategy over a catalog snapshot
//!         |
//!         v
//! ┌──────────────── attempt loop ────────────────┐
//! │ acquire permit (timeout) ─> ModelCaller.call  │
//! │        │                         │            │
//! │        │ timeout            ok / error        │
//! │        v                         v            │
//! │  record attempt, feed FailureTracker          │
//! │  strategy.decide() ─> Candidates / RetryInPlace / Exhausted
//! │  backoff (no permit held, cancellable)        │
//! └───────────────────────────────────────────────┘
//!         |
//!         v
//!   seal session ─> SessionTracker.record ─> observer
//! ```
//!
//! # Cancellation
//!
//! Every suspension point (admission wait, the call, backoff) races the
//! caller's `CancellationToken`. A cancelled dispatch releases whatever it
//! holds, seals its session as cancelled and records it. Sealing and
//! recording never straddle an `.await`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::admission::{deadline_after, AdmissionController, AdmissionError};
use super::catalog::{groups_from_config, CatalogError, GroupReference, TaskGroupCatalog};
use super::failure::FailureTracker;
use super::observer::{notify, DispatchObserver, TracingObserver};
use super::polling_pool::{PoolError, PoolLease, PoolManager};
use super::session::{FallbackAttempt, FallbackSession, SessionOutcome, SessionTracker};
use super::strategy::{
    FallbackConditions, FallbackDecision, GroupStrategy, PoolStrategy, RouteTarget,
    RoutingStrategy,
};
use crate::backend::{CallParameters, LlmError, LlmErrorKind, ModelCaller, ModelResponse};
use crate::config::{ConfigError, ConfigProvider, DispatchConfig, FallbackConfig};

// ============================================================================
// Errors
// ============================================================================

/// Why a single attempt failed
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AttemptError {
    /// The provider call failed
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// No admission permit could be obtained
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The polling pool refused a lease
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The caller cancelled the dispatch
    #[error("dispatch cancelled")]
    Cancelled,

    /// A parallel dispatch ran past its deadline
    #[error("parallel dispatch exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
}

impl AttemptError {
    /// Provider error kind, if this was a provider failure
    #[must_use]
    pub fn llm_kind(&self) -> Option<LlmErrorKind> {
        match self {
            Self::Llm(error) => Some(error.kind),
            _ => None,
        }
    }

    /// Whether the provider signalled a rate limit
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        self.llm_kind() == Some(LlmErrorKind::RateLimit)
    }

    /// Whether admission timed out
    #[must_use]
    pub fn is_admission_timeout(&self) -> bool {
        matches!(self, Self::Admission(AdmissionError::Timeout { .. }))
    }

    /// Whether no further attempt can help
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Pool(_)
                | Self::Cancelled
                | Self::DeadlineExceeded(_)
                | Self::Admission(AdmissionError::Closed { .. })
        )
    }

    /// Stable label used as a statistics key
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Llm(error) => error.kind.as_str(),
            Self::Admission(AdmissionError::Timeout { .. }) => "admission_timeout",
            Self::Admission(AdmissionError::Closed { .. }) => "admission_closed",
            Self::Pool(PoolError::Empty(_)) => "pool_empty",
            Self::Pool(_) => "pool_closed",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
        }
    }
}

/// Terminal failure: every allowed attempt failed
#[derive(Debug, Error)]
#[error(
    "fallback exhausted for '{}' after {} attempt(s): {last_error}",
    .session.primary(),
    .session.attempt_count()
)]
pub struct FallbackExhausted {
    /// Error of the final attempt
    pub last_error: AttemptError,
    /// The sealed session with the full attempt history
    pub session: Arc<FallbackSession>,
}

/// What a dispatch can fail with
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The primary target could not be resolved
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Every allowed attempt failed
    #[error(transparent)]
    Exhausted(Box<FallbackExhausted>),

    /// The caller cancelled the dispatch
    #[error("dispatch cancelled after {} attempt(s)", .session.attempt_count())]
    Cancelled { session: Arc<FallbackSession> },
}

impl DispatchError {
    /// The sealed session, if the dispatch got far enough to have one
    #[must_use]
    pub fn session(&self) -> Option<&Arc<FallbackSession>> {
        match self {
            Self::Catalog(_) => None,
            Self::Exhausted(exhausted) => Some(&exhausted.session),
            Self::Cancelled { session } => Some(session),
        }
    }

    /// The exhaustion details, if every attempt failed
    #[must_use]
    pub fn as_exhausted(&self) -> Option<&FallbackExhausted> {
        match self {
            Self::Exhausted(exhausted) => Some(exhausted),
            _ => None,
        }
    }

    /// Whether the dispatch was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

// ============================================================================
// Options / Outcome
// ============================================================================

/// Per-dispatch knobs
#[derive(Clone, Debug, Default)]
pub struct DispatchOptions {
    /// Attempt budget (defaults to the configured `max_attempts`)
    pub max_attempts: Option<u32>,
    /// Passed through to the model caller
    pub parameters: CallParameters,
    /// Per-acquire admission timeout (defaults to the configured one)
    pub acquire_timeout: Option<Duration>,
    /// Cancels the dispatch at its next suspension point
    pub cancel: Option<CancellationToken>,
}

impl DispatchOptions {
    /// Default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt budget
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set call parameters
    #[must_use]
    pub fn with_parameters(mut self, parameters: CallParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the admission timeout
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Knobs for [`FallbackEngine::dispatch_parallel`]
#[derive(Clone, Debug, Default)]
pub struct ParallelOptions {
    /// Extra targets raced alongside the primary
    pub fallbacks: Vec<String>,
    /// Ceiling for the whole race (defaults to the configured one)
    pub timeout: Option<Duration>,
    /// Passed through to the model caller
    pub parameters: CallParameters,
    /// Per-acquire admission timeout (defaults to the configured one)
    pub acquire_timeout: Option<Duration>,
    /// Cancels the race
    pub cancel: Option<CancellationToken>,
}

impl ParallelOptions {
    /// Race the primary against these targets
    #[must_use]
    pub fn with_fallbacks<I, S>(fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fallbacks: fallbacks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the race ceiling
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set call parameters
    #[must_use]
    pub fn with_parameters(mut self, parameters: CallParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// A successful dispatch
#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    /// The winning response
    pub response: ModelResponse,
    /// The sealed session
    pub session: Arc<FallbackSession>,
}

// ============================================================================
// Fallback Engine
// ============================================================================

/// A parallel entry that could not even be launched
enum Launch {
    Ready(RouteTarget, Option<PoolLease>),
    Refused(RouteTarget, AttemptError),
}

/// One engine, parameterized per dispatch by a [`RoutingStrategy`]
pub struct FallbackEngine {
    caller: Arc<dyn ModelCaller>,
    catalog: Arc<TaskGroupCatalog>,
    pools: Arc<PoolManager>,
    admission: Arc<AdmissionController>,
    failures: Arc<FailureTracker>,
    sessions: Arc<SessionTracker>,
    observer: Arc<dyn DispatchObserver>,
    tuning: RwLock<Arc<FallbackConfig>>,
}

impl FallbackEngine {
    /// Create an engine with empty topology and no limits
    pub fn new(caller: Arc<dyn ModelCaller>) -> Self {
        Self {
            caller,
            catalog: Arc::new(TaskGroupCatalog::new()),
            pools: Arc::new(PoolManager::new()),
            admission: Arc::new(AdmissionController::unlimited()),
            failures: Arc::new(FailureTracker::new()),
            sessions: Arc::new(SessionTracker::default()),
            observer: Arc::new(TracingObserver),
            tuning: RwLock::new(Arc::new(FallbackConfig::default())),
        }
    }

    /// Build every component from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config(
        config: &DispatchConfig,
        caller: Arc<dyn ModelCaller>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let catalog = TaskGroupCatalog::from_config(&config.groups)?;

        Ok(Self::new(caller)
            .with_catalog(Arc::new(catalog))
            .with_pools(Arc::new(PoolManager::from_config(&config.pools)))
            .with_admission(Arc::new(AdmissionController::new(config.admission.clone())))
            .with_sessions(Arc::new(SessionTracker::new(config.sessions.max_sessions)))
            .with_fallback_config(config.fallback.clone()))
    }

    /// Load configuration from a provider and build the engine
    ///
    /// # Errors
    ///
    /// Returns the provider's error or a validation error.
    pub fn from_provider(
        provider: &dyn ConfigProvider,
        caller: Arc<dyn ModelCaller>,
    ) -> Result<Self, ConfigError> {
        Self::from_config(&provider.load()?, caller)
    }

    /// Use a shared catalog
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<TaskGroupCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Use a shared pool manager
    #[must_use]
    pub fn with_pools(mut self, pools: Arc<PoolManager>) -> Self {
        self.pools = pools;
        self
    }

    /// Use a shared admission controller
    #[must_use]
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = admission;
        self
    }

    /// Use a shared failure tracker
    #[must_use]
    pub fn with_failures(mut self, failures: Arc<FailureTracker>) -> Self {
        self.failures = failures;
        self
    }

    /// Use a shared session tracker
    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<SessionTracker>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Replace the observer
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace fallback tuning
    #[must_use]
    pub fn with_fallback_config(self, tuning: FallbackConfig) -> Self {
        *self.tuning.write() = Arc::new(tuning);
        self
    }

    /// The task group catalog
    #[must_use]
    pub fn catalog(&self) -> &Arc<TaskGroupCatalog> {
        &self.catalog
    }

    /// The polling pools
    #[must_use]
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// The admission controller
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// The failure tracker
    #[must_use]
    pub fn failures(&self) -> &Arc<FailureTracker> {
        &self.failures
    }

    /// The session tracker
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Current fallback tuning
    #[must_use]
    pub fn fallback_config(&self) -> Arc<FallbackConfig> {
        Arc::clone(&self.tuning.read())
    }

    // ------------------------------------------------------------------------
    // Sequential dispatch
    // ------------------------------------------------------------------------

    /// Dispatch to a polling pool or group reference with cascading fallback
    ///
    /// # Errors
    ///
    /// Returns `Catalog` if `primary` cannot be resolved, `Exhausted` when
    /// every allowed attempt failed and `Cancelled` if the token fired.
    pub async fn dispatch(
        &self,
        primary: &str,
        payload: &Value,
        options: DispatchOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        let tuning = self.fallback_config();
        let (strategy, first) = self.plan(primary, &tuning)?;
        self.run(primary, strategy, first, payload, options, &tuning)
            .await
    }

    /// Dispatch with fallback gated by `conditions`
    ///
    /// An error no condition accepts ends the dispatch immediately.
    ///
    /// # Errors
    ///
    /// See [`FallbackEngine::dispatch`].
    pub async fn dispatch_conditional(
        &self,
        primary: &str,
        payload: &Value,
        conditions: FallbackConditions,
        options: DispatchOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        let tuning = self.fallback_config();
        let (inner, first) = self.plan(primary, &tuning)?;
        let strategy = RoutingStrategy::Conditional {
            inner: Box::new(inner),
            conditions,
        };
        self.run(primary, strategy, first, payload, options, &tuning)
            .await
    }

    /// Pick a strategy and the first target for `primary`
    fn plan(
        &self,
        primary: &str,
        tuning: &FallbackConfig,
    ) -> Result<(RoutingStrategy, Option<RouteTarget>), CatalogError> {
        if let Ok(pool) = self.pools.get(primary) {
            return Ok((RoutingStrategy::PollingPool(PoolStrategy::new(pool)), None));
        }

        let reference = GroupReference::parse(primary)?;
        let strategy = GroupStrategy::new(
            self.catalog.snapshot(),
            Arc::clone(&self.failures),
            tuning.failure_threshold,
        );
        let first = strategy
            .initial_targets(&reference)?
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::NoCandidates(reference.group.clone()))?;

        Ok((RoutingStrategy::GroupBased(strategy), Some(first)))
    }

    async fn run(
        &self,
        primary: &str,
        strategy: RoutingStrategy,
        first: Option<RouteTarget>,
        payload: &Value,
        options: DispatchOptions,
        tuning: &FallbackConfig,
    ) -> Result<DispatchOutcome, DispatchError> {
        let max_attempts = options.max_attempts.unwrap_or(tuning.max_attempts).max(1);
        let acquire_timeout = options
            .acquire_timeout
            .unwrap_or_else(|| self.admission.default_timeout());
        let cancel = options.cancel.unwrap_or_default();

        let mut session = FallbackSession::new(primary, strategy.name());
        let mut tried: HashSet<String> = HashSet::new();
        let mut next = first;
        let mut delay = Duration::ZERO;

        loop {
            let number = session.next_attempt_number();
            let started_at = Utc::now();
            let started = Instant::now();

            // Pools lease a fresh instance every attempt
            let (target, lease, result) = match strategy.pool() {
                Some(pool) => match pool.next() {
                    Ok(lease) => {
                        let target = RouteTarget::in_pool(pool.name(), lease.instance());
                        (target, Some(lease), None)
                    }
                    Err(error) => (
                        RouteTarget::model(pool.name()),
                        None,
                        Some(Err(AttemptError::from(error))),
                    ),
                },
                None => match next.take() {
                    Some(target) => (target, None, None),
                    // Only reachable before the first attempt
                    None => return Err(CatalogError::NoCandidates(primary.to_string()).into()),
                },
            };

            let result = match result {
                Some(refused) => refused,
                None => {
                    self.attempt(&target, payload, &options.parameters, acquire_timeout, &cancel)
                        .await
                }
            };
            drop(lease);
            let duration = started.elapsed();

            let error = match result {
                Ok(response) => {
                    self.failures.record_success(&target.model);
                    self.record_attempt(
                        &mut session,
                        FallbackAttempt::succeeded(
                            number,
                            target,
                            delay,
                            started_at,
                            duration,
                            response.clone(),
                        ),
                    );
                    return Ok(self.finish_success(session, response));
                }
                Err(error) => error,
            };

            // Admission and pool refusals say nothing about the model
            if matches!(error, AttemptError::Llm(_)) {
                self.failures.record_failure(&target.model);
            }
            tried.insert(target.model.clone());
            self.record_attempt(
                &mut session,
                FallbackAttempt::failed(
                    number,
                    target.clone(),
                    delay,
                    started_at,
                    duration,
                    error.clone(),
                ),
            );

            if matches!(error, AttemptError::Cancelled) {
                return Err(self.finish_cancelled(session));
            }
            if number >= max_attempts {
                return Err(self.finish_exhausted(session, error));
            }

            let decision = strategy.decide(&target, &error, &tried);
            delay = match decision {
                FallbackDecision::Exhausted => return Err(self.finish_exhausted(session, error)),
                FallbackDecision::Candidates(candidates) => match candidates.into_iter().next() {
                    Some(candidate) => {
                        next = Some(candidate);
                        Self::backoff(tuning, number, &error, false)
                    }
                    None => return Err(self.finish_exhausted(session, error)),
                },
                FallbackDecision::RetryInPlace => {
                    next = Some(target);
                    Self::backoff(tuning, number, &error, true)
                }
            };

            if !delay.is_zero() {
                tracing::debug!(
                    primary,
                    attempt = number,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before next attempt"
                );
                // Backoff suspension: no permit, no lock
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(self.finish_cancelled(session)),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    /// Delay before the attempt after `attempt`
    fn backoff(
        tuning: &FallbackConfig,
        attempt: u32,
        error: &AttemptError,
        in_place: bool,
    ) -> Duration {
        // Admission timeouts already waited; fall back immediately
        if error.is_admission_timeout() {
            return Duration::ZERO;
        }
        let delay = tuning.backoff_for_attempt(attempt);
        match error {
            // Honour the provider's hint only when retrying the same unit
            AttemptError::Llm(LlmError {
                retry_after: Some(hint),
                ..
            }) if in_place => delay
                .max(*hint)
                .min(Duration::from_millis(tuning.max_delay_ms)),
            _ => delay,
        }
    }

    /// One admission-guarded call
    async fn attempt(
        &self,
        target: &RouteTarget,
        payload: &Value,
        parameters: &CallParameters,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, AttemptError> {
        let scope = target.scope();
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AttemptError::Cancelled),
            permit = self.admission.acquire(&scope, acquire_timeout) => permit?,
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AttemptError::Cancelled),
            response = self.caller.call(&target.model, payload, parameters) => {
                response.map_err(AttemptError::from)
            }
        };

        self.admission.release(permit);
        result
    }

    // ------------------------------------------------------------------------
    // Parallel dispatch
    // ------------------------------------------------------------------------

    /// Race the primary and its fallbacks, returning the first success
    ///
    /// Each name may be a polling pool, a group reference (expanded to its
    /// candidates) or a bare model id. Losers are abandoned as soon as a
    /// winner arrives; only finished attempts are recorded.
    ///
    /// # Errors
    ///
    /// Returns `Catalog` if a group reference cannot be resolved, `Exhausted`
    /// when every racer failed or the deadline elapsed, and `Cancelled` if
    /// the token fired.
    pub async fn dispatch_parallel(
        &self,
        primary: &str,
        payload: &Value,
        options: ParallelOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        let tuning = self.fallback_config();
        let timeout = options.timeout.unwrap_or_else(|| tuning.parallel_timeout());
        let acquire_timeout = options
            .acquire_timeout
            .unwrap_or_else(|| self.admission.default_timeout());
        let cancel = options.cancel.unwrap_or_default();

        let names: Vec<&str> = std::iter::once(primary)
            .chain(options.fallbacks.iter().map(String::as_str))
            .collect();
        let launches = self.parallel_launches(&names)?;
        if launches.is_empty() {
            return Err(CatalogError::NoCandidates(primary.to_string()).into());
        }

        let mut session = FallbackSession::new(primary, RoutingStrategy::Parallel.name());
        let mut last_error = None;

        let race = cancel.child_token();
        let mut running = FuturesUnordered::new();
        for launch in launches {
            match launch {
                Launch::Refused(target, error) => {
                    let number = session.next_attempt_number();
                    self.record_attempt(
                        &mut session,
                        FallbackAttempt::failed(
                            number,
                            target,
                            Duration::ZERO,
                            Utc::now(),
                            Duration::ZERO,
                            error.clone(),
                        ),
                    );
                    last_error = Some(error);
                }
                Launch::Ready(target, lease) => {
                    let race = &race;
                    let parameters = &options.parameters;
                    running.push(async move {
                        let started_at = Utc::now();
                        let started = Instant::now();
                        let result = self
                            .attempt(&target, payload, parameters, acquire_timeout, race)
                            .await;
                        drop(lease);
                        (target, started_at, started.elapsed(), result)
                    });
                }
            }
        }

        let deadline = deadline_after(Instant::now(), timeout);
        loop {
            let next = tokio::time::timeout_at(deadline, running.next()).await;
            let finished = match next {
                Ok(Some(finished)) => finished,
                Ok(None) => break,
                Err(_) => {
                    race.cancel();
                    drop(running);
                    tracing::warn!(
                        primary,
                        timeout_ms = timeout.as_millis() as u64,
                        "Parallel dispatch deadline exceeded"
                    );
                    last_error = Some(AttemptError::DeadlineExceeded(timeout));
                    break;
                }
            };

            let (target, started_at, duration, result) = finished;
            let number = session.next_attempt_number();
            match result {
                Ok(response) => {
                    // Abandon the losers; their results are discarded
                    race.cancel();
                    drop(running);
                    self.failures.record_success(&target.model);
                    self.record_attempt(
                        &mut session,
                        FallbackAttempt::succeeded(
                            number,
                            target,
                            Duration::ZERO,
                            started_at,
                            duration,
                            response.clone(),
                        ),
                    );
                    return Ok(self.finish_success(session, response));
                }
                Err(error) => {
                    if matches!(error, AttemptError::Llm(_)) {
                        self.failures.record_failure(&target.model);
                    }
                    self.record_attempt(
                        &mut session,
                        FallbackAttempt::failed(
                            number,
                            target,
                            Duration::ZERO,
                            started_at,
                            duration,
                            error.clone(),
                        ),
                    );
                    if cancel.is_cancelled() {
                        drop(running);
                        return Err(self.finish_cancelled(session));
                    }
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.unwrap_or(AttemptError::DeadlineExceeded(timeout));
        Err(self.finish_exhausted(session, error))
    }

    /// Expand names into launchable targets, first occurrence of a model wins
    fn parallel_launches(&self, names: &[&str]) -> Result<Vec<Launch>, CatalogError> {
        let snapshot = self.catalog.snapshot();
        let mut seen = HashSet::new();
        let mut launches = Vec::new();

        for name in names {
            if let Ok(pool) = self.pools.get(name) {
                match pool.next() {
                    Ok(lease) => {
                        let target = RouteTarget::in_pool(pool.name(), lease.instance());
                        if seen.insert(target.model.clone()) {
                            launches.push(Launch::Ready(target, Some(lease)));
                        }
                    }
                    Err(error) => {
                        let target = RouteTarget::model(pool.name());
                        launches.push(Launch::Refused(target, error.into()));
                    }
                }
                continue;
            }

            let reference = GroupReference::parse(name)?;
            let targets = match snapshot.resolve(&reference) {
                Ok(resolved) => {
                    let echelon = resolved.echelon.map(|e| e.name).unwrap_or_default();
                    resolved
                        .candidates
                        .into_iter()
                        .map(|model| RouteTarget::in_group(&reference.group, &echelon, model))
                        .collect()
                }
                // A bare name that is not a group is a model id
                Err(CatalogError::GroupNotFound(_)) if reference.sub.is_none() => {
                    vec![RouteTarget::model(*name)]
                }
                Err(error) => return Err(error),
            };

            for target in targets {
                if seen.insert(target.model.clone()) {
                    launches.push(Launch::Ready(target, None));
                }
            }
        }

        Ok(launches)
    }

    // ------------------------------------------------------------------------
    // Session bookkeeping (synchronous: never straddles an await)
    // ------------------------------------------------------------------------

    fn record_attempt(&self, session: &mut FallbackSession, attempt: FallbackAttempt) {
        session.push_attempt(attempt);
        if let Some(recorded) = session.last_attempt() {
            notify(&self.observer, "on_attempt", |o| o.on_attempt(session, recorded));
        }
    }

    fn finish_success(
        &self,
        mut session: FallbackSession,
        response: ModelResponse,
    ) -> DispatchOutcome {
        session.seal(SessionOutcome::Succeeded, None);
        let session = Arc::new(session);
        self.sessions.record(Arc::clone(&session));
        notify(&self.observer, "on_success", |o| o.on_success(&session));
        DispatchOutcome { response, session }
    }

    fn finish_exhausted(
        &self,
        mut session: FallbackSession,
        last_error: AttemptError,
    ) -> DispatchError {
        session.seal(SessionOutcome::Failed, Some(last_error.clone()));
        let session = Arc::new(session);
        self.sessions.record(Arc::clone(&session));

        let exhausted = FallbackExhausted {
            last_error,
            session,
        };
        notify(&self.observer, "on_exhausted", |o| o.on_exhausted(&exhausted));
        DispatchError::Exhausted(Box::new(exhausted))
    }

    fn finish_cancelled(&self, mut session: FallbackSession) -> DispatchError {
        session.seal(SessionOutcome::Cancelled, Some(AttemptError::Cancelled));
        let session = Arc::new(session);
        self.sessions.record(Arc::clone(&session));
        tracing::info!(session = %session.id(), primary = %session.primary(), "Dispatch cancelled");
        DispatchError::Cancelled { session }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Swap in a new configuration
    ///
    /// Everything is validated before anything is swapped, so a bad
    /// configuration leaves the engine untouched. Dispatches already running
    /// finish against the topology they started with.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn reload(&self, config: &DispatchConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let groups = groups_from_config(&config.groups)?;

        self.catalog.reload(groups)?;
        self.pools.reload(&config.pools);
        self.admission.reconfigure(config.admission.clone());
        *self.tuning.write() = Arc::new(config.fallback.clone());
        self.sessions.set_capacity(config.sessions.max_sessions);

        tracing::info!(
            groups = config.groups.len(),
            pools = config.pools.len(),
            "Dispatch configuration reloaded"
        );
        Ok(())
    }

    /// Reload from a provider
    ///
    /// # Errors
    ///
    /// Returns the provider's error or a validation error.
    pub fn reload_from(&self, provider: &dyn ConfigProvider) -> Result<(), ConfigError> {
        self.reload(&provider.load()?)
    }

    /// Drain every polling pool, then refuse further admission
    ///
    /// Returns the number of pool leases force-closed after `grace`.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let forced = self.pools.shutdown_all(grace).await;
        self.admission.close();
        tracing::info!(forced, "Fallback engine shut down");
        forced
    }
}
