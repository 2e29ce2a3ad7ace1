//! Error types for the pasture orchestration core.
//!
//! Only configuration-class problems surface as `Err` from pipeline entry
//! points. Model and step failures travel as classified values
//! ([`FailureKind`], [`ModelError`]) so independent branches keep running.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;

/// The main error type for pasture operations.
#[derive(Debug, Error)]
pub enum PastureError {
    /// A pipeline or step was misconfigured.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The response cache failed.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// A model call failed after retries.
    #[error("{0}")]
    Model(#[from] ModelError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of a failure as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, connection failure or 5xx. Retried internally.
    Transient,
    /// Empty or too-short response, or output that failed validation.
    Quality,
    /// The host does not know the model.
    NotFound,
    /// The host rejected the request.
    Fatal,
    /// A template, schema or graph problem.
    Configuration,
    /// A dependency did not succeed, so the step never ran.
    Upstream,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Quality => write!(f, "quality"),
            Self::NotFound => write!(f, "not_found"),
            Self::Fatal => write!(f, "fatal"),
            Self::Configuration => write!(f, "configuration"),
            Self::Upstream => write!(f, "upstream"),
        }
    }
}

impl FailureKind {
    /// Returns true if the transport layer may retry this failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Error envelope returned by the model resource manager.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{kind} failure from model '{model}' after {attempts} attempt(s): {message}")]
pub struct ModelError {
    /// Failure classification.
    pub kind: FailureKind,
    /// The model that was called.
    pub model: String,
    /// Human-readable detail.
    pub message: String,
    /// Number of transport attempts made.
    pub attempts: usize,
}

impl ModelError {
    /// Creates a new model error.
    #[must_use]
    pub fn new(kind: FailureKind, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            message: message.into(),
            attempts: 0,
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Structured diagnostics attached to validation errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a pipeline or one of its steps is misconfigured.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The steps involved in the error.
    pub steps: Vec<String>,
    /// Optional diagnostics.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            steps: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the steps involved.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the diagnostics.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the dependency graph.
#[derive(Debug, Clone, Error)]
#[error("Circular dependency detected: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of steps forming the cycle.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        let summary = format!("Pipeline contains a dependency cycle: {}", err.cycle_path.join(" -> "));
        PipelineValidationError {
            message: err.to_string(),
            steps: err.cycle_path,
            error_info: Some(
                ErrorInfo::new("PIPELINE-CYCLE", summary)
                    .with_fix_hint("Remove one of the dependencies in the cycle to break it."),
            ),
        }
    }
}
