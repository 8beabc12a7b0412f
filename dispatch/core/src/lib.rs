//! Dispatch Core - Model Dispatch Reliability Layer
//!
//! This crate sits between application logic and LLM providers. It decides
//! which model to call, how many calls may run concurrently, and what to do
//! when a call fails. It never speaks a provider wire protocol itself: every
//! call goes through an injected [`ModelCaller`].
//!
//! # Architecture
//!
//! ```text
//!   caller
//!     │ dispatch("fast_group.echelon1", payload)
//!     v
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       FallbackEngine                         │
//! │   ┌──────────────┐   ┌──────────────┐   ┌─────────────────┐  │
//! │   │ TaskGroup    │   │ PoolManager  │   │ Admission       │  │
//! │   │ Catalog      │   │ (round-robin)│   │ Controller      │  │
//! │   └──────┬───────┘   └──────┬───────┘   └────────┬────────┘  │
//! │          └────────┬─────────┘                    │           │
//! │                   v                              │           │
//! │          ┌─────────────────┐   ┌──────────────┐  │           │
//! │          │ RoutingStrategy │<──│ Failure      │  │           │
//! │          └────────┬────────┘   │ Tracker      │  │           │
//! │                   │            └──────────────┘  │           │
//! │                   v                              v           │
//! │          attempt loop (backoff, cancellation, permits)       │
//! │                   │                                          │
//! │                   v                                          │
//! │          ┌─────────────────┐   ┌──────────────┐              │
//! │          │ SessionTracker  │   │ Observer     │              │
//! │          └─────────────────┘   └──────────────┘              │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                v
//!                          ModelCaller (provider client)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dispatch_core::{DispatchConfig, DispatchOptions, FallbackEngine};
//!
//! let config = DispatchConfig::from_toml_str(&text)?;
//! let engine = FallbackEngine::from_config(&config, Arc::new(MyClient))?;
//!
//! let payload = serde_json::json!({"prompt": "hi"});
//! let outcome = engine
//!     .dispatch("fast_group.echelon1", &payload, DispatchOptions::default())
//!     .await?;
//! println!(
//!     "{} answered after {} attempts",
//!     outcome.response.model,
//!     outcome.session.attempt_count()
//! );
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: The `ModelCaller` seam and typed provider errors
//! - [`config`]: Configuration types, environment overrides, providers
//! - [`routing`]: Catalog, pools, admission, strategies, engine, sessions

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod routing;

// Backend exports
pub use backend::{CallParameters, LlmError, LlmErrorKind, ModelCaller, ModelResponse};

// Config exports
pub use config::{
    AdmissionConfig, ConfigError, ConfigProvider, ConfigSource, DispatchConfig, EchelonConfig,
    FallbackConfig, GroupConfig, PoolConfig, ScopeLimits, SessionConfig, StaticConfig, TomlConfig,
};

// Routing exports
pub use routing::{
    AdmissionController, AdmissionError, AdmissionPermit, AdmissionScope, AttemptError,
    CatalogError, DispatchError, DispatchObserver, DispatchOptions, DispatchOutcome, Echelon,
    FailureTracker, FallbackAttempt, FallbackConditions, FallbackDecision, FallbackEngine,
    FallbackExhausted, FallbackSession, GroupReference, ParallelOptions, PollingPool, PoolError,
    SessionOutcome,
    PoolManager, RouteTarget, RoutingStrategy, SessionStats, SessionTracker, TaskGroup,
    TaskGroupCatalog, TracingObserver,
};
