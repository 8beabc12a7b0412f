//! Model Caller Integration
//!
//! Abstracted access to LLM providers through a single trait. The engine only
//! needs "call this model with this payload"; everything else lives in the
//! implementation.
//!
//! # Usage
//!
//! ```ignore
//! use dispatch_core::backend::{CallParameters, LlmError, ModelCaller, ModelResponse};
//!
//! struct MyClient;
//!
//! #[async_trait::async_trait]
//! impl ModelCaller for MyClient {
//!     async fn call(
//!         &self,
//!         model_id: &str,
//!         payload: &serde_json::Value,
//!         params: &CallParameters,
//!     ) -> Result<ModelResponse, LlmError> {
//!         // talk to the provider, map failures into LlmError
//!         # unimplemented!()
//!     }
//! }
//! ```

mod traits;

pub use traits::{CallParameters, LlmError, LlmErrorKind, ModelCaller, ModelResponse};
