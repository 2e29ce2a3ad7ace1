//! Steps: the units of work a pipeline schedules.
//!
//! A [`Step`] turns a JSON mapping into a [`StepResult`]. The two built-in
//! steps render a template, call a model through the [`ModelManager`],
//! repair the output, and walk their fallback chain on failure.

mod chat;
mod model;
mod output;
mod result;
mod spec;
mod template;

pub use chat::ChatModelStep;
pub use model::ModelStep;
pub use output::OutputPolicy;
pub use result::{StepError, StepResult, StepStatus};
pub use spec::{StepConfig, StepSpec};
pub use template::{PromptTemplate, TemplateError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::time::Instant;
use tracing::{info, warn};

use crate::errors::FailureKind;
use crate::models::ModelManager;

/// Kind of step, used in visualizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Single-prompt completion.
    #[default]
    Model,
    /// Chat completion.
    Chat,
    /// Anything else implementing [`Step`].
    Custom,
}

/// A unit of orchestrated work.
///
/// Implementations report failures through [`StepResult`] rather than
/// panicking, so the pipeline can keep scheduling independent branches.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Runs the step against `data`.
    async fn execute(&self, data: &Value) -> StepResult;

    /// Runs the step on its fallback models only.
    async fn get_fallback(&self, data: &Value) -> StepResult {
        let _ = data;
        StepResult::failed(
            StepError::new(FailureKind::NotFound, "No fallback models configured"),
            std::time::Duration::ZERO,
            self.model_name().map(ToString::to_string),
        )
    }

    /// Top-level input names the step needs before it can run.
    fn required_inputs(&self) -> Vec<String> {
        Vec::new()
    }

    /// The primary model, if any.
    fn model_name(&self) -> Option<&str> {
        None
    }

    /// The step kind.
    fn kind(&self) -> StepKind {
        StepKind::Custom
    }
}

/// Tries `primary` (when `try_primary`) and then each healthy fallback in order.
///
/// Configuration errors stop the chain immediately.
pub(crate) async fn run_with_fallbacks<F, Fut>(
    manager: &ModelManager,
    primary: &str,
    fallbacks: &[String],
    try_primary: bool,
    mut attempt: F,
) -> StepResult
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Value, StepError>>,
{
    let started = Instant::now();
    let mut failed_model = primary.to_string();
    let mut last_error: Option<StepError> = None;

    if try_primary {
        match attempt(primary.to_string()).await {
            Ok(output) => return StepResult::success(output, started.elapsed(), primary),
            Err(err) if err.is_configuration() => {
                return StepResult::failed(err, started.elapsed(), Some(primary.to_string()));
            }
            Err(err) => {
                warn!(model = primary, error = %err, "Primary model failed");
                last_error = Some(err);
            }
        }
    }

    let mut remaining: Vec<String> = fallbacks
        .iter()
        .filter(|candidate| candidate.as_str() != primary)
        .cloned()
        .collect();

    while let Some(model) = manager.get_fallback_model(&failed_model, &remaining) {
        remaining.retain(|candidate| candidate != &model);
        info!(failed_model = %failed_model, fallback = %model, "Trying fallback model");
        match attempt(model.clone()).await {
            Ok(output) => return StepResult::fallback_success(output, started.elapsed(), model),
            Err(err) if err.is_configuration() => {
                return StepResult::failed(err, started.elapsed(), Some(model));
            }
            Err(err) => {
                warn!(model = %model, error = %err, "Fallback model failed");
                last_error = Some(err);
                failed_model = model;
            }
        }
    }

    let error = last_error.unwrap_or_else(|| {
        StepError::new(FailureKind::NotFound, "No healthy fallback model available")
    });
    StepResult::failed(error, started.elapsed(), Some(failed_model))
}

/// Formats upstream `response` fields as `"<Key> analysis: <response>"` lines.
pub(crate) fn upstream_context(data: &Value) -> Vec<String> {
    let Some(map) = data.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let response = value.as_object()?.get("response")?;
            let text = match response {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            Some(format!("{} analysis: {text}", capitalize(key)))
        })
        .collect()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
