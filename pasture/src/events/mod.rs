//! Run lifecycle events.
//!
//! Pipelines report their progress through an [`EventSink`]. The default
//! sink writes every event to `tracing`; tests collect them instead.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Emitted once before any step starts.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// Emitted once after every step has a result.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// Emitted when a step is handed its input.
pub const STEP_STARTED: &str = "step.started";
/// Emitted when a step finishes with `SUCCESS` or `FALLBACK_SUCCESS`.
pub const STEP_COMPLETED: &str = "step.completed";
/// Emitted when a step finishes with `FAILED`.
pub const STEP_FAILED: &str = "step.failed";
/// Emitted when a step is skipped because an upstream step failed.
pub const STEP_SKIPPED: &str = "step.skipped";
