//! Dispatch Configuration
//!
//! Configuration types for task groups, polling pools, admission limits and
//! fallback tuning, plus the [`ConfigProvider`] seam the engine loads from.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. Environment variables (`DISPATCH_*`)
//! 2. TOML text handed in by the host application
//! 3. Default values
//!
//! Locating and reading configuration files is the host's job; this module
//! only parses what it is given.
//!
//! # Example Configuration
//!
//! ```toml
//! [fallback]
//! max_attempts = 3
//! base_delay_ms = 500
//! max_delay_ms = 10000
//!
//! [admission]
//! acquire_timeout_ms = 2000
//! global = { max_concurrent = 64 }
//! groups = { fast_group = { max_concurrent = 2 } }
//!
//! [[groups]]
//! name = "fast_group"
//!
//! [[groups.echelons]]
//! name = "echelon1"
//! priority = 1
//! models = ["modelA", "modelB"]
//!
//! [[groups.echelons]]
//! name = "echelon2"
//! priority = 2
//! models = ["modelC"]
//!
//! [[pools]]
//! name = "embedders"
//! instances = ["embed-1", "embed-2"]
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::catalog::CatalogError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A task group failed structural validation
    #[error("Invalid task group: {0}")]
    InvalidGroup(#[from] CatalogError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML text
    Toml,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::Toml => write!(f, "toml"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Routing Topology
// =============================================================================

/// One priority tier of a task group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchelonConfig {
    /// Echelon name, unique within its group
    pub name: String,
    /// Priority (lower is tried first)
    pub priority: u32,
    /// Candidate model ids in preference order
    pub models: Vec<String>,
}

/// A named task group
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Group name, unique within the catalog
    pub name: String,
    /// Priority tiers, in any order
    pub echelons: Vec<EchelonConfig>,
    /// Task aliases: task name -> echelon name
    pub tasks: HashMap<String, String>,
}

/// A flat round-robin pool of interchangeable instances
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name
    pub name: String,
    /// Instance ids in rotation order
    pub instances: Vec<String>,
}

// =============================================================================
// Admission Limits
// =============================================================================

/// Concurrency and rate limits for one admission scope
///
/// Every limit is optional; an all-`None` value means unlimited.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeLimits {
    /// Maximum permits outstanding at once
    pub max_concurrent: Option<usize>,
    /// Steady-state admissions per second (token bucket refill rate)
    pub requests_per_second: Option<f64>,
    /// Token bucket capacity; defaults to the per-second rate rounded up
    pub burst_size: Option<u32>,
}

impl ScopeLimits {
    /// No limits
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Concurrency limit only
    #[must_use]
    pub fn concurrency(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: Some(max_concurrent),
            ..Self::default()
        }
    }

    /// Add a token bucket rate limit
    #[must_use]
    pub fn with_rate(mut self, requests_per_second: f64, burst_size: u32) -> Self {
        self.requests_per_second = Some(requests_per_second);
        self.burst_size = Some(burst_size);
        self
    }

    /// Whether no limit is configured
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.max_concurrent.is_none() && self.requests_per_second.is_none()
    }

    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.max_concurrent == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "{scope}: max_concurrent must be at least 1"
            )));
        }
        if let Some(rate) = self.requests_per_second {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{scope}: requests_per_second must be positive"
                )));
            }
        }
        if self.burst_size == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "{scope}: burst_size must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Admission control configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Limits applied to every dispatch
    pub global: ScopeLimits,
    /// Per-group limits (pools count as groups)
    pub groups: HashMap<String, ScopeLimits>,
    /// Per-model limits
    pub models: HashMap<String, ScopeLimits>,
    /// Limits for groups without an explicit entry
    pub default_group: ScopeLimits,
    /// Limits for models without an explicit entry
    pub default_model: ScopeLimits,
    /// How long a dispatch waits for a permit before falling back
    pub acquire_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global: ScopeLimits::default(),
            groups: HashMap::new(),
            models: HashMap::new(),
            default_group: ScopeLimits::default(),
            default_model: ScopeLimits::default(),
            acquire_timeout_ms: 30_000,
        }
    }
}

impl AdmissionConfig {
    /// Effective limits for a group
    #[must_use]
    pub fn limits_for_group(&self, group: &str) -> &ScopeLimits {
        self.groups.get(group).unwrap_or(&self.default_group)
    }

    /// Effective limits for a model
    #[must_use]
    pub fn limits_for_model(&self, model: &str) -> &ScopeLimits {
        self.models.get(model).unwrap_or(&self.default_model)
    }

    /// Permit acquisition timeout
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Set a group limit
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>, limits: ScopeLimits) -> Self {
        self.groups.insert(group.into(), limits);
        self
    }

    /// Set a model limit
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, limits: ScopeLimits) -> Self {
        self.models.insert(model.into(), limits);
        self
    }

    /// Set the global limit
    #[must_use]
    pub fn with_global(mut self, limits: ScopeLimits) -> Self {
        self.global = limits;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.global.validate("admission.global")?;
        self.default_group.validate("admission.default_group")?;
        self.default_model.validate("admission.default_model")?;
        for (name, limits) in &self.groups {
            limits.validate(&format!("admission.groups.{name}"))?;
        }
        for (name, limits) in &self.models {
            limits.validate(&format!("admission.models.{name}"))?;
        }
        Ok(())
    }
}

// =============================================================================
// Fallback Tuning
// =============================================================================

/// Attempt budget and backoff for the fallback loop
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Maximum attempts per dispatch (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub exponential_base: f64,
    /// Scale each delay by a random factor in [0.5, 1.0]
    pub jitter: bool,
    /// Failures after which a target is considered saturated
    pub failure_threshold: u32,
    /// Ceiling for a parallel dispatch as a whole
    pub parallel_timeout_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
            failure_threshold: 3,
            parallel_timeout_ms: 60_000,
        }
    }
}

impl FallbackConfig {
    /// Lower bound of the jitter factor
    pub const JITTER_MIN: f64 = 0.5;

    /// Backoff before the attempt following `attempt` (1-based), without jitter
    ///
    /// `min(max_delay, base_delay * exponential_base^(attempt - 1))`
    #[must_use]
    pub fn unjittered_backoff(&self, attempt: u32) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff for `attempt` scaled by an explicit jitter factor
    #[must_use]
    pub fn backoff_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        self.unjittered_backoff(attempt)
            .mul_f64(factor.clamp(Self::JITTER_MIN, 1.0))
    }

    /// Backoff for `attempt`, jittered when enabled
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if self.jitter {
            let factor = rand::thread_rng().gen_range(Self::JITTER_MIN..=1.0);
            self.backoff_with_factor(attempt, factor)
        } else {
            self.unjittered_backoff(attempt)
        }
    }

    /// Parallel dispatch ceiling
    #[must_use]
    pub fn parallel_timeout(&self) -> Duration {
        Duration::from_millis(self.parallel_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "fallback.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(ConfigError::ValidationError(
                "fallback.exponential_base must be >= 1.0".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::ValidationError(
                "fallback.max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "fallback.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session history retention
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions kept before the oldest are evicted
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_sessions: 1_000 }
    }
}

// =============================================================================
// Full Configuration
// =============================================================================

/// Complete dispatch configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Task groups, in catalog order
    pub groups: Vec<GroupConfig>,
    /// Polling pools
    pub pools: Vec<PoolConfig>,
    /// Admission limits
    pub admission: AdmissionConfig,
    /// Fallback tuning
    pub fallback: FallbackConfig,
    /// Session retention
    pub sessions: SessionConfig,
    /// Where the configuration came from
    #[serde(skip)]
    source: ConfigSource,
}

impl DispatchConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text)?;
        config.source = ConfigSource::Toml;
        Ok(config)
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Add a task group
    #[must_use]
    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.groups.push(group);
        self
    }

    /// Add a polling pool
    #[must_use]
    pub fn with_pool(mut self, name: impl Into<String>, instances: Vec<String>) -> Self {
        self.pools.push(PoolConfig {
            name: name.into(),
            instances,
        });
        self
    }

    /// Replace admission limits
    #[must_use]
    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    /// Replace fallback tuning
    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = fallback;
        self
    }

    /// Apply `DISPATCH_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply `DISPATCH_*` overrides from an arbitrary lookup
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse::<T>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
                    None
                }
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        let mut touched = false;

        if let Some(v) = parsed::<u32>(lookup, "DISPATCH_MAX_ATTEMPTS") {
            self.fallback.max_attempts = v;
            touched = true;
        }
        if let Some(v) = parsed::<u64>(lookup, "DISPATCH_BASE_DELAY_MS") {
            self.fallback.base_delay_ms = v;
            touched = true;
        }
        if let Some(v) = parsed::<u64>(lookup, "DISPATCH_MAX_DELAY_MS") {
            self.fallback.max_delay_ms = v;
            touched = true;
        }
        if let Some(raw) = lookup("DISPATCH_JITTER") {
            self.fallback.jitter = raw != "0" && !raw.eq_ignore_ascii_case("false");
            touched = true;
        }
        if let Some(v) = parsed::<u32>(lookup, "DISPATCH_FAILURE_THRESHOLD") {
            self.fallback.failure_threshold = v;
            touched = true;
        }
        if let Some(v) = parsed::<u64>(lookup, "DISPATCH_ACQUIRE_TIMEOUT_MS") {
            self.admission.acquire_timeout_ms = v;
            touched = true;
        }
        if let Some(v) = parsed::<usize>(lookup, "DISPATCH_MAX_SESSIONS") {
            self.sessions.max_sessions = v;
            touched = true;
        }

        if touched {
            self.source = ConfigSource::Env;
        }
    }

    /// Check cross-field invariants
    ///
    /// Group structure (priorities, candidates) is validated when the catalog
    /// is built; this covers everything else.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fallback.validate()?;
        self.admission.validate()?;

        if self.sessions.max_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "sessions.max_sessions must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for group in &self.groups {
            if !names.insert(group.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate group or pool name: {}",
                    group.name
                )));
            }
        }
        for pool in &self.pools {
            if pool.instances.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "pool {} has no instances",
                    pool.name
                )));
            }
            if !names.insert(pool.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate group or pool name: {}",
                    pool.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Providers
// =============================================================================

/// Supplies the engine with configuration, initially and on reload
pub trait ConfigProvider: Send + Sync {
    /// Produce the current configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be produced or is invalid.
    fn load(&self) -> Result<DispatchConfig, ConfigError>;
}

/// In-memory configuration
#[derive(Clone, Debug, Default)]
pub struct StaticConfig(pub DispatchConfig);

impl ConfigProvider for StaticConfig {
    fn load(&self) -> Result<DispatchConfig, ConfigError> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

/// TOML text obtained by the host, with environment overrides applied on load
#[derive(Clone, Debug)]
pub struct TomlConfig {
    text: String,
    apply_env: bool,
}

impl TomlConfig {
    /// Wrap TOML text; environment overrides are applied on load
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            apply_env: true,
        }
    }

    /// Skip environment overrides
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.apply_env = false;
        self
    }
}

impl ConfigProvider for TomlConfig {
    fn load(&self) -> Result<DispatchConfig, ConfigError> {
        let mut config = DispatchConfig::from_toml_str(&self.text)?;
        if self.apply_env {
            config.apply_env();
        }
        config.validate()?;
        tracing::debug!(
            groups = config.groups.len(),
            pools = config.pools.len(),
            source = %config.source(),
            "Loaded dispatch configuration"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[fallback]
max_attempts = 4
base_delay_ms = 100
max_delay_ms = 1000
jitter = false

[admission]
acquire_timeout_ms = 250
global = { max_concurrent = 8 }
groups = { fast_group = { max_concurrent = 2 } }
models = { modelA = { max_concurrent = 1, requests_per_second = 5.0, burst_size = 5 } }

[[groups]]
name = "fast_group"
tasks = { summarize = "echelon2" }

[[groups.echelons]]
name = "echelon1"
priority = 1
models = ["modelA", "modelB"]

[[groups.echelons]]
name = "echelon2"
priority = 2
models = ["modelC"]

[[pools]]
name = "embedders"
instances = ["embed-1", "embed-2"]
"#;

    #[test]
    fn test_default_config() {
        let config = DispatchConfig::default();

        assert_eq!(config.fallback.max_attempts, 3);
        assert_eq!(config.fallback.failure_threshold, 3);
        assert!(config.fallback.jitter);
        assert_eq!(config.admission.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(config.sessions.max_sessions, 1_000);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_valid_toml() {
        let config = DispatchConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.source(), ConfigSource::Toml);
        assert_eq!(config.fallback.max_attempts, 4);
        assert!(!config.fallback.jitter);
        // Untouched fields keep their defaults
        assert_eq!(config.fallback.failure_threshold, 3);

        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].echelons[1].models, vec!["modelC".to_string()]);
        assert_eq!(config.groups[0].tasks.get("summarize").map(String::as_str), Some("echelon2"));

        assert_eq!(config.pools[0].instances.len(), 2);
        assert_eq!(config.admission.global.max_concurrent, Some(8));
        assert_eq!(config.admission.limits_for_group("fast_group").max_concurrent, Some(2));
        assert_eq!(config.admission.limits_for_group("other"), &ScopeLimits::default());
        assert_eq!(config.admission.limits_for_model("modelA").requests_per_second, Some(5.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_toml_error() {
        let result = DispatchConfig::from_toml_str("[fallback\nmax_attempts = ");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DISPATCH_MAX_ATTEMPTS", "7"),
            ("DISPATCH_JITTER", "false"),
            ("DISPATCH_ACQUIRE_TIMEOUT_MS", "not-a-number"),
            ("DISPATCH_MAX_SESSIONS", "42"),
        ]
        .into_iter()
        .collect();

        let mut config = DispatchConfig::from_toml_str(SAMPLE).unwrap();
        config.apply_env_from(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.fallback.max_attempts, 7);
        assert!(!config.fallback.jitter);
        // Unparseable values are ignored
        assert_eq!(config.admission.acquire_timeout_ms, 250);
        assert_eq!(config.sessions.max_sessions, 42);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_no_env_keeps_source() {
        let mut config = DispatchConfig::from_toml_str(SAMPLE).unwrap();
        config.apply_env_from(|_| None);
        assert_eq!(config.source(), ConfigSource::Toml);
    }

    #[test]
    fn test_backoff_progression() {
        let config = FallbackConfig {
            base_delay_ms: 100,
            exponential_base: 2.0,
            max_delay_ms: 1000,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_millis(800));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_millis(1000)); // Capped
        assert_eq!(config.backoff_for_attempt(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_non_decreasing_and_bounded() {
        let config = FallbackConfig {
            base_delay_ms: 30,
            exponential_base: 1.7,
            max_delay_ms: 5_000,
            jitter: false,
            ..Default::default()
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let delay = config.unjittered_backoff(attempt);
            assert!(delay >= previous);
            assert!(delay <= config.unjittered_backoff(u32::MAX));
            assert!(delay <= Duration::from_millis(config.max_delay_ms));
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = FallbackConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: true,
            ..Default::default()
        };

        for attempt in 1..6 {
            let ceiling = config.unjittered_backoff(attempt);
            for _ in 0..50 {
                let delay = config.backoff_for_attempt(attempt);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling.mul_f64(FallbackConfig::JITTER_MIN));
            }
        }

        assert_eq!(
            config.backoff_with_factor(2, 0.1),
            Duration::from_millis(1_000),
            "factor is clamped to the jitter floor"
        );
    }

    #[test]
    fn test_zero_base_delay() {
        let config = FallbackConfig {
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.backoff_for_attempt(9), Duration::ZERO);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = DispatchConfig::default();
        config.fallback.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let config = DispatchConfig::default()
            .with_admission(
                AdmissionConfig::default().with_group("g", ScopeLimits::concurrency(0)),
            );
        assert!(config.validate().is_err());

        let config = DispatchConfig::default()
            .with_group(GroupConfig {
                name: "dup".to_string(),
                ..Default::default()
            })
            .with_pool("dup", vec!["a".to_string()]);
        assert!(config.validate().is_err());

        let config = DispatchConfig::default().with_pool("empty", Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_providers() {
        let provider = TomlConfig::new(SAMPLE).without_env();
        let config = provider.load().unwrap();
        assert_eq!(config.groups[0].name, "fast_group");

        let provider = StaticConfig(config.clone());
        assert_eq!(provider.load().unwrap(), config);

        let invalid = StaticConfig(DispatchConfig::default().with_pool("p", Vec::new()));
        assert!(invalid.load().is_err());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::Toml.to_string(), "toml");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
