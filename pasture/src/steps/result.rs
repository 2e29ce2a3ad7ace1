//! Step result types.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use crate::errors::{FailureKind, ModelError};
use crate::utils::duration_secs;

/// Terminal status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// The primary model produced the output.
    Success,
    /// A fallback model produced the output.
    FallbackSuccess,
    /// Every model failed, or the step was misconfigured.
    Failed,
    /// Not run because a dependency did not succeed.
    Skipped,
}

impl StepStatus {
    /// Returns true for `Success` and `FallbackSuccess`.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::FallbackSuccess)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::FallbackSuccess => write!(f, "FALLBACK_SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Classified step failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl StepError {
    /// Creates a step error.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A misconfiguration that no fallback model can fix.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Configuration, message)
    }

    /// Returns true if trying another model cannot help.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.kind == FailureKind::Configuration
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<ModelError> for StepError {
    fn from(err: ModelError) -> Self {
        Self::new(err.kind, err.to_string())
    }
}

/// The outcome of one step invocation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Terminal status.
    pub status: StepStatus,
    /// Structured output.
    pub output: Value,
    /// Wall time spent in the step.
    #[serde(rename = "time", with = "duration_secs")]
    pub elapsed: Duration,
    /// The model that produced the output, or the last one tried.
    pub model: Option<String>,
    /// True when a fallback model produced the output.
    pub fallback: bool,
    /// Failure detail for `Failed` and `Skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// The rendered prompt, when the step renders one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl StepResult {
    /// Output produced by the primary model.
    #[must_use]
    pub fn success(output: Value, elapsed: Duration, model: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Success,
            output,
            elapsed,
            model: Some(model.into()),
            fallback: false,
            error: None,
            prompt: None,
        }
    }

    /// Output produced by a fallback model.
    #[must_use]
    pub fn fallback_success(output: Value, elapsed: Duration, model: impl Into<String>) -> Self {
        Self {
            status: StepStatus::FallbackSuccess,
            fallback: true,
            ..Self::success(output, elapsed, model)
        }
    }

    /// A failed step. The output mirrors the error for downstream readers.
    #[must_use]
    pub fn failed(error: StepError, elapsed: Duration, model: Option<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: json!({ "response": format!("Error: {}", error.message), "error": error.kind }),
            elapsed,
            model,
            fallback: false,
            error: Some(error),
            prompt: None,
        }
    }

    /// A step that never ran.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        let error = StepError::new(FailureKind::Upstream, reason);
        Self {
            status: StepStatus::Skipped,
            output: Value::Null,
            elapsed: Duration::ZERO,
            model: None,
            fallback: false,
            error: Some(error),
            prompt: None,
        }
    }

    /// Attaches the rendered prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Returns true for `Success` and `FallbackSuccess`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Serializes to `{"output", "time", "status", "model", "fallback"}` plus optional fields.
    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
