//! Model Caller Traits
//!
//! The dispatch engine never talks to a provider directly. It hands a model id,
//! a JSON payload and call parameters to a [`ModelCaller`] and gets back either a
//! [`ModelResponse`] or a typed [`LlmError`].
//!
//! # Design Philosophy
//!
//! Implementations own everything provider-specific: wire format, auth, token
//! accounting, transport errors. They must map every failure into an
//! [`LlmError`] so the engine can reason about it (a rate limit is handled very
//! differently from a bad request) and the application never sees a raw
//! transport exception.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Category of a provider failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    /// Provider rejected the call because a quota or rate limit was hit
    RateLimit,
    /// The call did not complete in time
    Timeout,
    /// Credentials missing, expired or insufficient
    Authentication,
    /// Model or endpoint does not exist
    NotFound,
    /// The request itself was malformed or unacceptable
    InvalidRequest,
    /// Provider is overloaded or down
    ServiceUnavailable,
    /// Output or input blocked by a content policy
    ContentFilter,
    /// Anything the caller could not classify
    Other,
}

impl LlmErrorKind {
    /// Stable lowercase name, used as a statistics key
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::NotFound => "not_found",
            Self::InvalidRequest => "invalid_request",
            Self::ServiceUnavailable => "service_unavailable",
            Self::ContentFilter => "content_filter",
            Self::Other => "other",
        }
    }

    /// Whether the same call may succeed if simply tried again later
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Timeout | Self::ServiceUnavailable
        )
    }

    /// Classify an HTTP status code returned by a provider
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit,
            408 | 504 => Self::Timeout,
            401 | 403 => Self::Authentication,
            404 => Self::NotFound,
            400 | 413 | 422 => Self::InvalidRequest,
            500 | 502 | 503 => Self::ServiceUnavailable,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure reported by a [`ModelCaller`]
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind} from {model}: {message}")]
pub struct LlmError {
    /// Failure category
    pub kind: LlmErrorKind,
    /// Model that produced the failure
    pub model: String,
    /// Provider message, already stripped of secrets
    pub message: String,
    /// Provider hint for when the call may be retried
    pub retry_after: Option<Duration>,
}

impl LlmError {
    /// Create a new error
    pub fn new(kind: LlmErrorKind, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Rate limit error
    pub fn rate_limited(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::RateLimit, model, message)
    }

    /// Timeout error
    pub fn timeout(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Timeout, model, message)
    }

    /// Service unavailable error
    pub fn unavailable(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::ServiceUnavailable, model, message)
    }

    /// Build from an HTTP status code
    pub fn from_status(status: u16, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::from_status(status), model, message)
    }

    /// Attach a retry-after hint
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether this error signals a rate limit
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        self.kind == LlmErrorKind::RateLimit
    }

    /// Whether this error is worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

// ============================================================================
// Call Parameters / Response
// ============================================================================

/// Per-call generation parameters passed through to the caller untouched
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallParameters {
    /// Maximum tokens in the response (0 = provider default)
    pub max_tokens: u32,
    /// Sampling temperature (0.0-2.0)
    pub temperature: f32,
    /// System prompt, if any
    pub system: Option<String>,
    /// Per-call timeout the caller should enforce
    pub timeout: Option<Duration>,
    /// Provider-specific extras
    pub extra: Map<String, Value>,
}

impl Default for CallParameters {
    fn default() -> Self {
        Self {
            max_tokens: 0,
            temperature: 0.7,
            system: None,
            timeout: None,
            extra: Map::new(),
        }
    }
}

impl CallParameters {
    /// Create default parameters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a provider-specific extra
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A successful model response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The response text
    pub content: String,
    /// Model that generated the response
    pub model: String,
    /// Tokens used (if reported)
    pub tokens_used: Option<u32>,
    /// Generation time in milliseconds (if reported)
    pub duration_ms: Option<u64>,
}

impl ModelResponse {
    /// Create a response with content only
    pub fn new(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            tokens_used: None,
            duration_ms: None,
        }
    }
}

// ============================================================================
// Model Caller
// ============================================================================

/// The "call one target" collaborator
///
/// Implement this trait to plug a provider client into the engine. The engine
/// calls it once per attempt, never while holding a lock, and always with an
/// admission permit held for the target's scope.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "model-caller"
    }

    /// Call a single model
    async fn call(
        &self,
        model_id: &str,
        payload: &Value,
        params: &CallParameters,
    ) -> Result<ModelResponse, LlmError>;
}
