//! # Pasture
//!
//! Dependency-ordered orchestration of hosted text-generation models.
//!
//! Pasture combines:
//!
//! - **Pipelines**: named steps with dependencies, run with maximal concurrency
//! - **Model management**: health tracking, residency control, retry and fallback
//! - **Response caching**: fingerprinted requests with per-entry expiry
//! - **Output repair**: extraction, repair, schema validation and model-assisted patching
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pasture::prelude::*;
//! use std::sync::Arc;
//!
//! let manager = Arc::new(ModelManager::from_config(Config::from_file_or_default("config.json"))?);
//!
//! let pipeline = PipelineBuilder::new("analysis")
//!     .step("economic", ModelStep::new(manager.clone(), "llama3", "Economic view of {query}")?, &[])
//!     .step("social", ModelStep::new(manager.clone(), "mistral", "Social view of {query}")?, &[])
//!     .step(
//!         "integration",
//!         ModelStep::new(manager.clone(), "llama3", "Combine {economic.response} and {social.response}")?,
//!         &["economic", "social"],
//!     )
//!     .build()?;
//!
//! let run = pipeline.run(serde_json::json!({"query": "the city"})).await?;
//! println!("{}", run.to_json());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod json;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod steps;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheStats, FileCache, InMemoryCache, ResponseCache};
    pub use crate::config::{Config, JsonPatchingConfig, PipelineConfig, RetrySettings};
    pub use crate::errors::{
        CycleDetectedError, ErrorInfo, FailureKind, ModelError, PastureError,
        PipelineValidationError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::json::{parse, repair_json, FieldType, ObjectSchema, Schema};
    pub use crate::logging::init_tracing;
    pub use crate::models::{
        ChatMessage, InferenceBackend, ModelManager, ModelResponse, ModelState, RetryPolicy,
        SimulatedBackend,
    };
    pub use crate::pipeline::{Pipeline, PipelineBuilder, PipelineRun, RunStatus};
    pub use crate::steps::{
        ChatModelStep, ModelStep, Step, StepConfig, StepResult, StepSpec, StepStatus,
    };
}
