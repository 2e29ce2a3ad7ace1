//! Step declarations accepted by the pipeline builder.
//!
//! A step is declared either as a ready instance or as a plain mapping.
//! Mappings are resolved into concrete steps once, when the pipeline is built.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::{ChatModelStep, ModelStep, Step, StepKind};
use crate::errors::{ErrorInfo, PipelineValidationError};
use crate::json::{ObjectSchema, Schema};
use crate::models::ModelManager;

/// A step described as data.
///
/// ```json
/// {"kind": "model", "model": "llama3", "prompt_template": "Answer: {query}"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// `model` or `chat`.
    pub kind: StepKind,
    /// Primary model.
    pub model: String,
    /// Prompt for `model` steps.
    pub prompt_template: Option<String>,
    /// System prompt for `chat` steps.
    pub system_prompt: Option<String>,
    /// User message template for `chat` steps.
    pub user_template: Option<String>,
    /// Sampling options.
    pub options: Option<Value>,
    /// Fallback models, in priority order.
    pub fallback_models: Vec<String>,
    /// Output schema in the form accepted by [`ObjectSchema::from_json`].
    pub output_schema: Option<Value>,
    /// Require structured output even without a schema.
    pub json_output: bool,
    /// Overrides the configured patching switch.
    pub use_patching: Option<bool>,
    /// Overrides the configured patching attempt limit.
    pub max_patching_attempts: Option<usize>,
    /// Overrides the configured patching prompt.
    pub patching_prompt: Option<String>,
    /// Overrides the configured text fallback.
    pub fallback_to_text: Option<bool>,
}

fn step_config_error(step: &str, reason: impl Into<String>) -> PipelineValidationError {
    let reason = reason.into();
    PipelineValidationError::new(format!("Step '{step}' is misconfigured: {reason}"))
        .with_steps(vec![step.to_string()])
        .with_error_info(ErrorInfo::new("PIPELINE-STEP-CONFIG", reason))
}

macro_rules! apply_output_settings {
    ($step:expr, $config:expr, $schema:expr) => {{
        let mut step = $step.with_json_output($config.json_output);
        if let Some(schema) = $schema {
            step = step.with_schema(schema);
        }
        if let Some(options) = $config.options {
            step = step.with_options(options);
        }
        if let Some(enabled) = $config.use_patching {
            step = step.with_patching(enabled);
        }
        if let Some(attempts) = $config.max_patching_attempts {
            step = step.with_max_patching_attempts(attempts);
        }
        if let Some(prompt) = $config.patching_prompt {
            step = step.with_patching_prompt(prompt);
        }
        if let Some(enabled) = $config.fallback_to_text {
            step = step.with_fallback_to_text(enabled);
        }
        step.with_fallback_models($config.fallback_models)
    }};
}

impl StepConfig {
    /// Resolves the mapping into a concrete step named `name`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown kinds, missing fields,
    /// bad templates or invalid schemas.
    pub fn build(
        self,
        name: &str,
        manager: &Arc<ModelManager>,
    ) -> Result<Arc<dyn Step>, PipelineValidationError> {
        if self.model.trim().is_empty() {
            return Err(step_config_error(name, "'model' is required"));
        }
        let schema: Option<Arc<dyn Schema>> = match &self.output_schema {
            Some(description) => Some(Arc::new(ObjectSchema::from_json(description).map_err(
                |err| err.with_steps(vec![name.to_string()]),
            )?)),
            None => None,
        };

        match self.kind {
            StepKind::Model => {
                let Some(template) = self.prompt_template.as_deref() else {
                    return Err(step_config_error(name, "'prompt_template' is required for model steps"));
                };
                let step = ModelStep::new(manager.clone(), &self.model, template)
                    .map_err(|err| err.into_validation_error(name))?;
                Ok(Arc::new(apply_output_settings!(step, self, schema)))
            }
            StepKind::Chat => {
                let mut step = ChatModelStep::new(manager.clone(), &self.model);
                if let Some(system) = self.system_prompt.as_deref() {
                    step = step
                        .with_system_prompt(system)
                        .map_err(|err| err.into_validation_error(name))?;
                }
                if let Some(user) = self.user_template.as_deref() {
                    step = step
                        .with_user_template(user)
                        .map_err(|err| err.into_validation_error(name))?;
                }
                Ok(Arc::new(apply_output_settings!(step, self, schema)))
            }
            StepKind::Custom => Err(step_config_error(
                name,
                "custom steps must be supplied as instances",
            )),
        }
    }
}

/// How a step is supplied to the pipeline builder.
#[derive(Clone)]
pub enum StepSpec {
    /// A ready step.
    Instance(Arc<dyn Step>),
    /// A mapping resolved at build time.
    Config(StepConfig),
}

impl fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(step) => f.debug_tuple("Instance").field(step).finish(),
            Self::Config(config) => f.debug_tuple("Config").field(config).finish(),
        }
    }
}

impl StepSpec {
    /// Parses a mapping into a [`StepSpec::Config`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the mapping has the wrong shape.
    pub fn from_value(name: &str, value: Value) -> Result<Self, PipelineValidationError> {
        serde_json::from_value(value)
            .map(Self::Config)
            .map_err(|err| step_config_error(name, err.to_string()))
    }

    /// Resolves into a concrete step.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a mapping cannot be resolved, or if
    /// no manager is available to resolve it with.
    pub fn resolve(
        self,
        name: &str,
        manager: Option<&Arc<ModelManager>>,
    ) -> Result<Arc<dyn Step>, PipelineValidationError> {
        match self {
            Self::Instance(step) => Ok(step),
            Self::Config(config) => {
                let manager = manager.ok_or_else(|| {
                    step_config_error(name, "configured steps need a model manager")
                })?;
                config.build(name, manager)
            }
        }
    }
}

impl From<Arc<dyn Step>> for StepSpec {
    fn from(step: Arc<dyn Step>) -> Self {
        Self::Instance(step)
    }
}

impl From<StepConfig> for StepSpec {
    fn from(config: StepConfig) -> Self {
        Self::Config(config)
    }
}

impl From<ModelStep> for StepSpec {
    fn from(step: ModelStep) -> Self {
        Self::Instance(Arc::new(step))
    }
}

impl From<ChatModelStep> for StepSpec {
    fn from(step: ChatModelStep) -> Self {
        Self::Instance(Arc::new(step))
    }
}
