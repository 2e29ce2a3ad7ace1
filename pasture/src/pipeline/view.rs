//! A renderable description of a pipeline's graph.

use serde::{Deserialize, Serialize};

use crate::steps::StepKind;

/// One step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Step name.
    pub id: String,
    /// Display label.
    pub label: String,
    /// Step kind.
    pub kind: StepKind,
    /// Primary model, when the step has one.
    pub model: Option<String>,
}

/// A "runs before" edge from a dependency to its dependent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// The dependency.
    pub from: String,
    /// The dependent.
    pub to: String,
}

/// Nodes in declaration order and edges grouped by dependent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineGraph {
    /// Every step.
    pub nodes: Vec<GraphNode>,
    /// Every dependency edge.
    pub edges: Vec<GraphEdge>,
}

impl PipelineGraph {
    /// Serializes to `{"nodes": [...], "edges": [...]}`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
