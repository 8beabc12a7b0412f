//! Shared fixtures for dispatch integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use dispatch_core::{
    CallParameters, DispatchConfig, FallbackEngine, LlmError, LlmErrorKind, ModelCaller,
    ModelResponse,
};

/// Topology used across scenarios
pub const TOPOLOGY: &str = r#"
[fallback]
max_attempts = 5
base_delay_ms = 10
max_delay_ms = 1000
jitter = false

[[groups]]
name = "fast_group"

[[groups.echelons]]
name = "echelon1"
priority = 1
models = ["model-a", "model-b"]

[[groups.echelons]]
name = "echelon2"
priority = 2
models = ["model-c"]

[groups.tasks]
summarize = "echelon1"

[[groups]]
name = "backup_group"

[[groups.echelons]]
name = "primary"
priority = 1
models = ["model-z"]

[[pools]]
name = "embedders"
instances = ["embed-1", "embed-2", "embed-3"]
"#;

static TRACING: Once = Once::new();

/// Route test logs through `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Parsed topology without environment overrides
pub fn topology() -> DispatchConfig {
    DispatchConfig::from_toml_str(TOPOLOGY).expect("topology parses")
}

/// Engine over [`TOPOLOGY`] backed by `caller`
pub fn engine_with(caller: Arc<ScriptedCaller>) -> FallbackEngine {
    init_tracing();
    FallbackEngine::from_config(&topology(), caller).expect("topology is valid")
}

/// Mock caller with per-model scripts and concurrency tracking
#[derive(Debug, Default)]
pub struct ScriptedCaller {
    scripts: Mutex<HashMap<String, VecDeque<Result<ModelResponse, LlmError>>>>,
    broken: Mutex<HashMap<String, LlmErrorKind>>,
    latencies: Mutex<HashMap<String, Duration>>,
    history: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedCaller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_result(&self, model: &str, result: Result<ModelResponse, LlmError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn fail_always(&self, model: &str, kind: LlmErrorKind) {
        self.broken.lock().unwrap().insert(model.to_string(), kind);
    }

    pub fn set_latency(&self, model: &str, latency: Duration) {
        self.latencies
            .lock()
            .unwrap()
            .insert(model.to_string(), latency);
    }

    pub fn calls(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    pub fn call_count(&self, model: &str) -> usize {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|m| *m == model)
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

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

        if let Some(kind) = self.broken.lock().unwrap().get(model_id) {
            return Err(LlmError::new(*kind, model_id, "scripted failure"));
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model_id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(ModelResponse::new(model_id, format!("ok from {model_id}"))))
    }
}
