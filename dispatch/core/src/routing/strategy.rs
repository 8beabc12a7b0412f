//! Routing Strategies
//!
//! A strategy answers one question for the engine: after this attempt failed,
//! where should the next one go? It answers with a [`FallbackDecision`] value
//! rather than an error, so routine fallback never unwinds through `?`.
//!
//! # Group-Based Fallback
//!
//! ```text
//! attempt on fast_group.echelon1/modelA fails
//!         |
//!         v
//! 1. rate limit, admission timeout, or failures >= threshold?
//!        -> untried siblings in echelon1            (modelB)
//!         |  empty / not triggered
//!         v
//! 2. later echelons of fast_group, in priority order
//!        -> first one with untried candidates       (modelC)
//!         |  empty
//!         v
//! 3. first echelon of every other group (last resort)
//! ```
//!
//! Targets already tried in the session are never offered again, so the
//! cascade always makes progress and terminates.
//!
//! # Polling Pools
//!
//! A pool is one opaque retry unit. Its strategy never names fallback
//! candidates; it tells the engine to retry in place, and the pool rotates to
//! its next instance on the next lease.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::admission::AdmissionScope;
use super::catalog::{CatalogError, CatalogSnapshot, GroupReference};
use super::engine::AttemptError;
use super::failure::FailureTracker;
use super::polling_pool::PollingPool;
use crate::backend::LlmErrorKind;

// ============================================================================
// Route Target
// ============================================================================

/// A concrete model to call, with where it came from
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteTarget {
    /// Model (or pool instance) id passed to the caller
    pub model: String,
    /// Enclosing task group or polling pool
    pub group: Option<String>,
    /// Echelon within the group
    pub echelon: Option<String>,
}

impl RouteTarget {
    /// A model outside any group
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            group: None,
            echelon: None,
        }
    }

    /// A model in a group echelon
    pub fn in_group(
        group: impl Into<String>,
        echelon: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            group: Some(group.into()),
            echelon: Some(echelon.into()),
        }
    }

    /// An instance leased from a polling pool
    pub fn in_pool(pool: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            model: instance.into(),
            group: Some(pool.into()),
            echelon: None,
        }
    }

    /// Admission scope for a call to this target
    #[must_use]
    pub fn scope(&self) -> AdmissionScope {
        AdmissionScope::Model {
            group: self.group.clone(),
            model: self.model.clone(),
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.group, &self.echelon) {
            (Some(group), Some(echelon)) => write!(f, "{group}.{echelon}/{}", self.model),
            (Some(group), None) => write!(f, "{group}/{}", self.model),
            _ => f.write_str(&self.model),
        }
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// What the engine should do after a failed attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackDecision {
    /// Try these targets next, in order
    Candidates(Vec<RouteTarget>),
    /// Try the same unit again (a pool rotates internally)
    RetryInPlace,
    /// Nothing left to try
    Exhausted,
}

impl FallbackDecision {
    /// Whether the dispatch should stop
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

// ============================================================================
// Group-Based Strategy
// ============================================================================

/// Cascading fallback across echelons and groups
///
/// Works against one catalog snapshot so a dispatch sees a single, consistent
/// topology even if the catalog is reloaded mid-flight.
#[derive(Clone)]
pub struct GroupStrategy {
    catalog: Arc<CatalogSnapshot>,
    failures: Arc<FailureTracker>,
    failure_threshold: u32,
}

impl GroupStrategy {
    /// Default failures after which a target counts as saturated
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

    /// Create a strategy over a catalog snapshot
    pub fn new(
        catalog: Arc<CatalogSnapshot>,
        failures: Arc<FailureTracker>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            catalog,
            failures,
            failure_threshold,
        }
    }

    /// Targets for the first attempt of a reference
    ///
    /// # Errors
    ///
    /// Returns the catalog error for an unknown group or echelon and
    /// `NoCandidates` for a group that resolves to nothing.
    pub fn initial_targets(
        &self,
        reference: &GroupReference,
    ) -> Result<Vec<RouteTarget>, CatalogError> {
        let resolved = self.catalog.resolve(reference)?;
        let Some(echelon) = resolved.echelon else {
            return Err(CatalogError::NoCandidates(reference.group.clone()));
        };

        Ok(resolved
            .candidates
            .iter()
            .map(|model| RouteTarget::in_group(&reference.group, &echelon.name, model))
            .collect())
    }

    /// Ordered fallback candidates after `current` failed with `error`
    ///
    /// `tried` holds every model already attempted in the session.
    #[must_use]
    pub fn next_targets(
        &self,
        current: &RouteTarget,
        error: &AttemptError,
        tried: &HashSet<String>,
    ) -> Vec<RouteTarget> {
        let Some(group_name) = current.group.as_deref() else {
            return Vec::new();
        };
        let Some(group) = self.catalog.get(group_name) else {
            return Vec::new();
        };

        let untried = |echelon: &super::catalog::Echelon| -> Vec<RouteTarget> {
            echelon
                .models
                .iter()
                .filter(|m| **m != current.model && !tried.contains(*m))
                .map(|m| RouteTarget::in_group(group.name(), &echelon.name, m))
                .collect()
        };

        let echelon = current
            .echelon
            .as_deref()
            .and_then(|name| group.echelon(name))
            .or_else(|| group.echelon_of(&current.model));

        if let Some(echelon) = echelon {
            // 1. Same echelon when the target is throttled or saturated
            let saturated = error.is_rate_limit()
                || error.is_admission_timeout()
                || self
                    .failures
                    .is_saturated(&current.model, self.failure_threshold);
            if saturated {
                let siblings = untried(echelon);
                if !siblings.is_empty() {
                    return siblings;
                }
            }

            // 2. Later echelons of the same group
            for later in group.echelons_after(echelon.priority) {
                let candidates = untried(later);
                if !candidates.is_empty() {
                    return candidates;
                }
            }
        }

        // 3. Cross-group last resort
        self.catalog
            .groups()
            .filter(|other| other.name() != group.name())
            .filter_map(|other| other.primary_echelon().map(|e| (other, e)))
            .flat_map(|(other, echelon)| {
                echelon
                    .models
                    .iter()
                    .filter(|m| **m != current.model && !tried.contains(*m))
                    .map(|m| RouteTarget::in_group(other.name(), &echelon.name, m))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl fmt::Debug for GroupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupStrategy")
            .field("catalog_version", &self.catalog.version())
            .field("failure_threshold", &self.failure_threshold)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Polling Strategy
// ============================================================================

/// Retry-in-place over a polling pool
#[derive(Clone, Debug)]
pub struct PoolStrategy {
    pool: Arc<PollingPool>,
}

impl PoolStrategy {
    /// Create a strategy for a pool
    #[must_use]
    pub fn new(pool: Arc<PollingPool>) -> Self {
        Self { pool }
    }

    /// The pool being rotated
    #[must_use]
    pub fn pool(&self) -> &Arc<PollingPool> {
        &self.pool
    }

    /// Always empty; the pool rotates internally
    #[must_use]
    pub fn next_targets(&self) -> Vec<RouteTarget> {
        Vec::new()
    }
}

// ============================================================================
// Conditions
// ============================================================================

type Predicate = Arc<dyn Fn(&AttemptError) -> bool + Send + Sync>;

/// Caller-supplied gates on whether an error may trigger fallback
///
/// Fallback continues when any predicate accepts the error. With no
/// predicates, nothing is accepted.
#[derive(Clone, Default)]
pub struct FallbackConditions {
    predicates: Vec<(String, Predicate)>,
}

impl FallbackConditions {
    /// No conditions
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named predicate
    #[must_use]
    pub fn when<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&AttemptError) -> bool + Send + Sync + 'static,
    {
        self.predicates.push((name.into(), Arc::new(predicate)));
        self
    }

    /// Fall back on rate limits, timeouts, outages and admission timeouts
    #[must_use]
    pub fn transient() -> Self {
        Self::new().when("transient", |error| {
            error.is_admission_timeout() || error.llm_kind().is_some_and(|k| k.is_transient())
        })
    }

    /// Fall back only on the given provider error kinds
    #[must_use]
    pub fn on_kinds(kinds: &[LlmErrorKind]) -> Self {
        let kinds: Vec<LlmErrorKind> = kinds.to_vec();
        let name = kinds
            .iter()
            .map(LlmErrorKind::as_str)
            .collect::<Vec<_>>()
            .join("|");
        Self::new().when(name, move |error| {
            error.llm_kind().is_some_and(|k| kinds.contains(&k))
        })
    }

    /// Whether any predicate accepts the error
    #[must_use]
    pub fn accepts(&self, error: &AttemptError) -> bool {
        self.predicates.iter().any(|(_, predicate)| predicate(error))
    }

    /// Number of predicates
    #[must_use]
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Whether there are no predicates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl fmt::Debug for FallbackConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.predicates.iter().map(|(name, _)| name))
            .finish()
    }
}

// ============================================================================
// Routing Strategy
// ============================================================================

/// The strategy driving one dispatch
#[derive(Clone, Debug)]
pub enum RoutingStrategy {
    /// Cascade across echelons and groups
    GroupBased(GroupStrategy),
    /// Retry in place on a polling pool
    PollingPool(PoolStrategy),
    /// Every target launched at once; no sequential fallback
    Parallel,
    /// An inner strategy gated by error predicates
    Conditional {
        inner: Box<RoutingStrategy>,
        conditions: FallbackConditions,
    },
}

impl RoutingStrategy {
    /// Short name recorded on sessions
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::GroupBased(_) => "group",
            Self::PollingPool(_) => "polling_pool",
            Self::Parallel => "parallel",
            Self::Conditional { .. } => "conditional",
        }
    }

    /// Decide what follows a failed attempt
    #[must_use]
    pub fn decide(
        &self,
        current: &RouteTarget,
        error: &AttemptError,
        tried: &HashSet<String>,
    ) -> FallbackDecision {
        if error.is_terminal() {
            return FallbackDecision::Exhausted;
        }

        match self {
            Self::GroupBased(strategy) => {
                let candidates = strategy.next_targets(current, error, tried);
                if candidates.is_empty() {
                    FallbackDecision::Exhausted
                } else {
                    FallbackDecision::Candidates(candidates)
                }
            }
            Self::PollingPool(strategy) => {
                // No fallback list: the pool itself is retried
                let candidates = strategy.next_targets();
                if candidates.is_empty() {
                    FallbackDecision::RetryInPlace
                } else {
                    FallbackDecision::Candidates(candidates)
                }
            }
            Self::Parallel => FallbackDecision::Exhausted,
            Self::Conditional { inner, conditions } => {
                if conditions.accepts(error) {
                    inner.decide(current, error, tried)
                } else {
                    tracing::debug!(
                        target_id = %current,
                        error = %error,
                        "No fallback condition accepted the error"
                    );
                    FallbackDecision::Exhausted
                }
            }
        }
    }

    /// The polling pool behind this strategy, if any
    #[must_use]
    pub fn pool(&self) -> Option<&Arc<PollingPool>> {
        match self {
            Self::PollingPool(strategy) => Some(strategy.pool()),
            Self::Conditional { inner, .. } => inner.pool(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LlmError;
    use crate::routing::admission::AdmissionError;
    use crate::routing::catalog::{Echelon, TaskGroup, TaskGroupCatalog};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn models(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    fn catalog() -> TaskGroupCatalog {
        TaskGroupCatalog::with_groups(vec![
            TaskGroup::new(
                "fast_group",
                vec![
                    Echelon::new("echelon1", 1, models(&["modelA", "modelB"])),
                    Echelon::new("echelon2", 2, models(&["modelC"])),
                ],
            )
            .unwrap(),
            TaskGroup::new(
                "batch",
                vec![
                    Echelon::new("main", 1, models(&["modelD", "modelE"])),
                    Echelon::new("spare", 2, models(&["modelF"])),
                ],
            )
            .unwrap(),
        ])
        .unwrap()
    }

    fn strategy(failures: Arc<FailureTracker>) -> GroupStrategy {
        GroupStrategy::new(catalog().snapshot(), failures, 3)
    }

    fn llm(kind: LlmErrorKind, model: &str) -> AttemptError {
        AttemptError::Llm(LlmError::new(kind, model, "boom"))
    }

    fn tried(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    fn names(targets: &[RouteTarget]) -> Vec<&str> {
        targets.iter().map(|t| t.model.as_str()).collect()
    }

    #[test]
    fn test_initial_targets() {
        let strategy = strategy(Arc::new(FailureTracker::new()));
        let targets = strategy
            .initial_targets(&GroupReference::parse("fast_group").unwrap())
            .unwrap();
        assert_eq!(targets[0], RouteTarget::in_group("fast_group", "echelon1", "modelA"));
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_empty_group_has_no_candidates() {
        let empty = TaskGroup::new("empty", Vec::new()).unwrap();
        let catalog = TaskGroupCatalog::with_groups(vec![empty]).unwrap();
        let strategy = GroupStrategy::new(catalog.snapshot(), Arc::new(FailureTracker::new()), 3);
        assert_eq!(
            strategy.initial_targets(&GroupReference::group("empty")).unwrap_err(),
            CatalogError::NoCandidates("empty".to_string())
        );
    }

    #[test]
    fn test_rate_limit_stays_in_echelon() {
        let strategy = strategy(Arc::new(FailureTracker::new()));
        let current = RouteTarget::in_group("fast_group", "echelon1", "modelA");

        let next = strategy.next_targets(
            &current,
            &llm(LlmErrorKind::RateLimit, "modelA"),
            &tried(&["modelA"]),
        );
        assert_eq!(names(&next), vec!["modelB"]);
    }

    #[test]
    fn test_admission_timeout_stays_in_echelon() {
        let strategy = strategy(Arc::new(FailureTracker::new()));
        let current = RouteTarget::in_group("fast_group", "echelon1", "modelA");
        let error = AttemptError::Admission(AdmissionError::Timeout {
            scope: "model:modelA".to_string(),
            waited: Duration::from_secs(1),
        });

        let next = strategy.next_targets(&current, &error, &tried(&["modelA"]));
        assert_eq!(names(&next), vec!["modelB"]);
    }

    #[test]
    fn test_other_errors_advance_echelon() {
        let strategy = strategy(Arc::new(FailureTracker::new()));
        let current = RouteTarget::in_group("fast_group", "echelon1", "modelA");

        let next = strategy.next_targets(
            &current,
            &llm(LlmErrorKind::ServiceUnavailable, "modelA"),
            &tried(&["modelA"]),
        );
        assert_eq!(names(&next), vec!["modelC"]);
    }

    #[test]
    fn test_threshold_stays_in_echelon() {
        let failures = Arc::new(FailureTracker::new());
        for _ in 0..3 {
            failures.record_failure("modelA");
        }
        let strategy = strategy(failures);
        let current = RouteTarget::in_group("fast_group", "echelon1", "modelA");

        let next = strategy.next_targets(
            &current,
            &llm(LlmErrorKind::ServiceUnavailable, "modelA"),
            &tried(&["modelA"]),
        );
        assert_eq!(names(&next), vec!["modelB"]);
    }

    #[test]
    fn test_exhausted_echelon_advances() {
        let strategy = strategy(Arc::new(FailureTracker::new()));
        let current = RouteTarget::in_group("fast_group", "echelon1", "modelB");

        let next = strategy.next_targets(
            &current,
            &llm(LlmErrorKind::RateLimit, "modelB"),
            &tried(&["modelA", "modelB"]),
        );
        assert_eq!(names(&next), vec!["modelC"]);
    }

    #[test]
    fn test_cross_group_last_resort() {
        let strategy = strategy(Arc::new(FailureTracker::new()));
        let current = RouteTarget::in_group("fast_group", "echelon2", "modelC");

        let next = strategy.next_targets(
            &current,
            &llm(LlmErrorKind::Timeout, "modelC"),
            &tried(&["modelA", "modelB", "modelC"]),
        );
        // Only the first echelon of other groups
        assert_eq!(names(&next), vec!["modelD", "modelE"]);
        assert_eq!(next[0].group.as_deref(), Some("batch"));

        let none = strategy.next_targets(
            &current,
            &llm(LlmErrorKind::Timeout, "modelC"),
            &tried(&["modelA", "modelB", "modelC", "modelD", "modelE"]),
        );
        assert!(none.is_empty());
    }

    #[test]
    fn test_decisions() {
        let group = RoutingStrategy::GroupBased(strategy(Arc::new(FailureTracker::new())));
        let current = RouteTarget::in_group("fast_group", "echelon1", "modelA");
        let error = llm(LlmErrorKind::RateLimit, "modelA");

        assert!(matches!(
            group.decide(&current, &error, &tried(&["modelA"])),
            FallbackDecision::Candidates(_)
        ));
        assert!(group
            .decide(&current, &AttemptError::Cancelled, &tried(&["modelA"]))
            .is_exhausted());

        let pool = RoutingStrategy::PollingPool(PoolStrategy::new(Arc::new(PollingPool::new(
            "p",
            models(&["i1"]),
        ))));
        assert_eq!(
            pool.decide(&current, &error, &HashSet::new()),
            FallbackDecision::RetryInPlace
        );
        assert!(pool.pool().is_some());

        let parallel = RoutingStrategy::Parallel;
        assert_eq!(parallel.name(), "parallel");
        assert!(parallel.decide(&current, &error, &HashSet::new()).is_exhausted());
    }

    #[test]
    fn test_conditional_gates_fallback() {
        let inner = RoutingStrategy::GroupBased(strategy(Arc::new(FailureTracker::new())));
        let conditional = RoutingStrategy::Conditional {
            inner: Box::new(inner),
            conditions: FallbackConditions::on_kinds(&[LlmErrorKind::RateLimit]),
        };
        let current = RouteTarget::in_group("fast_group", "echelon1", "modelA");

        assert!(!conditional
            .decide(&current, &llm(LlmErrorKind::RateLimit, "modelA"), &tried(&["modelA"]))
            .is_exhausted());
        assert!(conditional
            .decide(&current, &llm(LlmErrorKind::Authentication, "modelA"), &tried(&["modelA"]))
            .is_exhausted());
        assert_eq!(conditional.name(), "conditional");
    }

    #[test]
    fn test_condition_presets() {
        let transient = FallbackConditions::transient();
        assert!(transient.accepts(&llm(LlmErrorKind::Timeout, "m")));
        assert!(!transient.accepts(&llm(LlmErrorKind::ContentFilter, "m")));
        assert!(!FallbackConditions::new().accepts(&llm(LlmErrorKind::Timeout, "m")));

        let custom = FallbackConditions::new().when("content", |e| {
            e.llm_kind() == Some(LlmErrorKind::ContentFilter)
        });
        assert!(custom.accepts(&llm(LlmErrorKind::ContentFilter, "m")));
        assert_eq!(format!("{custom:?}"), "[\"content\"]");
    }

    #[test]
    fn test_target_display_and_scope() {
        let target = RouteTarget::in_group("g", "e", "m");
        assert_eq!(target.to_string(), "g.e/m");
        assert_eq!(target.scope(), AdmissionScope::model_in("g", "m"));
        assert_eq!(RouteTarget::in_pool("p", "i").to_string(), "p/i");
        assert_eq!(RouteTarget::model("m").scope(), AdmissionScope::model("m"));
    }
}
