//! Model resource management.
//!
//! [`ModelManager`] is the single entry point for talking to an inference
//! host. It layers caching, residency control, retry and health tracking
//! over a pluggable [`InferenceBackend`].

mod backend;
mod manager;
#[cfg(feature = "ollama")]
mod ollama;
mod retry;
mod simulated;
mod status;

pub use backend::{
    BackendError, BackendReply, ChatMessage, ChatRequest, GenerateRequest, InferenceBackend,
};
#[cfg(test)]
pub use backend::MockInferenceBackend;
pub use manager::{ModelManager, ModelResponse};
#[cfg(feature = "ollama")]
pub use ollama::OllamaBackend;
pub use retry::{
    should_retry, with_retry, Attempted, BackoffStrategy, Classify, JitterStrategy, RetryDecision,
    RetryPolicy, RetryState,
};
pub use simulated::SimulatedBackend;
pub use status::{ModelState, ModelStatus, ModelStatusReport};
