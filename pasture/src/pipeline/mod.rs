//! Dependency-ordered execution of steps.
//!
//! This module provides:
//! - [`PipelineBuilder`] to declare steps and validate the graph
//! - [`Pipeline`] to run it with maximal concurrency
//! - [`PipelineRun`] describing the outcome

mod builder;
mod executor;
mod graph;
mod integration_tests;
mod run;
mod view;

pub use builder::PipelineBuilder;
pub use executor::{Pipeline, STEP_FAILED_MARKER};
pub use graph::DependencyGraph;
pub use run::{PipelineRun, RunStatus};
pub use view::{GraphEdge, GraphNode, PipelineGraph};
