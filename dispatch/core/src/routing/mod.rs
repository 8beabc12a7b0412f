#![allow(missing_docs)]
//! Reliable Model Dispatch
//!
//! Everything between "I want an answer from this task group" and a single
//! provider call: topology, admission, routing, fallback and bookkeeping.
//!
//! # Architecture
//!
//! ```text
//! +--------------------+
//! |   FallbackEngine   |  <-- Entry point: dispatch / parallel / conditional
//! +---------+----------+
//!           |
//!     +-----+------+----------------+
//!     |            |                |
//!     v            v                v
//! +---------+ +------------+ +----------------+
//! | Catalog | | PoolManager| | RoutingStrategy|  <-- Who to call next
//! +---------+ +------------+ +----------------+
//!           |
//!           v
//! +--------------------+
//! | AdmissionController|  <-- Global / group / model limits
//! +---------+----------+
//!           |
//!           v
//! +--------------------+
//! |    ModelCaller     |  <-- Provider transport (injected)
//! +--------------------+
//!           |
//!     +-----+------+
//!     v            v
//! FailureTracker  SessionTracker ──> DispatchObserver
//! ```
//!
//! # Design Principles
//!
//! 1. **No Lost Permits**: every admission and pool slot is an RAII guard
//! 2. **Snapshots, Not Locks**: reloads swap immutable snapshots
//! 3. **Bounded Memory**: sessions and statistics live in a fixed window
//! 4. **Cancellable Everywhere**: no await outlives the caller's interest

pub mod admission;
pub mod catalog;
pub mod engine;
pub mod failure;
pub mod observer;
pub mod polling_pool;
pub mod session;
pub mod strategy;

#[cfg(test)]
pub mod test_utils;

pub use admission::{
    AdmissionController, AdmissionError, AdmissionPermit, AdmissionScope, ScopeKey, ScopeStats,
};
pub use catalog::{
    groups_from_config, CatalogError, CatalogSnapshot, Echelon, GroupReference, ResolvedGroup,
    TaskGroup, TaskGroupCatalog,
};
pub use engine::{
    AttemptError, DispatchError, DispatchOptions, DispatchOutcome, FallbackEngine,
    FallbackExhausted, ParallelOptions,
};
pub use failure::{FailureRecord, FailureTracker};
pub use observer::{DispatchObserver, TracingObserver};
pub use polling_pool::{PollingPool, PoolError, PoolLease, PoolManager, PoolState, PoolStats};
pub use session::{
    FallbackAttempt, FallbackSession, SessionOutcome, SessionStats, SessionTracker, TargetStats,
};
pub use strategy::{
    FallbackConditions, FallbackDecision, GroupStrategy, PoolStrategy, RouteTarget,
    RoutingStrategy,
};
