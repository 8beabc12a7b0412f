//! Scripted Caller Test Utilities
//!
//! A `ModelCaller` whose behaviour is scripted per model, so routing and
//! fallback can be exercised without a provider.
//!
//! # Usage
//!
//! ```ignore
//! let caller = ScriptedCaller::new();
//! caller.fail_always("model-a", LlmErrorKind::ServiceUnavailable);
//! caller.push_result("model-b", Err(LlmError::rate_limited("model-b", "slow down")));
//!
//! // ... dispatch ...
//! assert_eq!(caller.calls(), vec!["model-a", "model-b", "model-b"]);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::{CallParameters, LlmError, LlmErrorKind, ModelCaller, ModelResponse};

/// Mock caller with per-model scripts
#[derive(Debug, Default)]
pub struct ScriptedCaller {
    /// One-shot results consumed in order
    scripts: Mutex<HashMap<String, VecDeque<Result<ModelResponse, LlmError>>>>,
    /// Models that fail every call
    broken: Mutex<HashMap<String, LlmErrorKind>>,
    /// Simulated call latency per model
    latencies: Mutex<HashMap<String, Duration>>,
    /// Every model called, in call order
    history: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedCaller {
    /// Every model answers "ok from <model>" until scripted otherwise
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot result for `model`
    pub fn push_result(&self, model: &str, result: Result<ModelResponse, LlmError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(result);
    }

    /// Make every call to `model` fail with `kind`
    pub fn fail_always(&self, model: &str, kind: LlmErrorKind) {
        self.broken.lock().unwrap().insert(model.to_string(), kind);
    }

    /// Undo [`ScriptedCaller::fail_always`]
    pub fn heal(&self, model: &str) {
        self.broken.lock().unwrap().remove(model);
    }

    /// Delay every call to `model`
    pub fn set_latency(&self, model: &str, latency: Duration) {
        self.latencies
            .lock()
            .unwrap()
            .insert(model.to_string(), latency);
    }

    /// Models called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    /// Number of calls made to `model`
    pub fn call_count(&self, model: &str) -> usize {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|m| *m == model)
            .count()
    }

    /// Calls currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most calls ever running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn scripted(&self, model: &str) -> Result<ModelResponse, LlmError> {
        if let Some(kind) = self.broken.lock().unwrap().get(model) {
            return Err(LlmError::new(*kind, model, "scripted failure"));
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(ModelResponse::new(model, format!("ok from {model}"))))
    }
}

/// Decrements the in-flight counter even if the call is dropped mid-way
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelCaller for ScriptedCaller {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn call(
        &self,
        model_id: &str,
        _payload: &Value,
        _params: &CallParameters,
    ) -> Result<ModelResponse, LlmError> {
        self.history.lock().unwrap().push(model_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let latency = self.latencies.lock().unwrap().get(model_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.scripted(model_id)
    }
}
