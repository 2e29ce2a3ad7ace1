//! Single-prompt completion step.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::output::OutputPolicy;
use super::result::{StepError, StepResult};
use super::template::{PromptTemplate, TemplateError};
use super::{run_with_fallbacks, Step, StepKind};
use crate::json::Schema;
use crate::models::ModelManager;

/// Renders a prompt template and sends it to a model.
#[derive(Debug, Clone)]
pub struct ModelStep {
    manager: Arc<ModelManager>,
    model: String,
    template: PromptTemplate,
    options: Value,
    fallback_models: Vec<String>,
    output: OutputPolicy,
}

impl ModelStep {
    /// Creates a step for `model` using `prompt_template`.
    ///
    /// Patching settings default to the manager's configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is malformed.
    pub fn new(
        manager: Arc<ModelManager>,
        model: impl Into<String>,
        prompt_template: &str,
    ) -> Result<Self, TemplateError> {
        let template = PromptTemplate::parse(prompt_template)?;
        let output = OutputPolicy::from_config(&manager.config().json_patching);
        Ok(Self {
            manager,
            model: model.into(),
            template,
            options: json!({ "temperature": 0.7 }),
            fallback_models: Vec::new(),
            output,
        })
    }

    /// Sets the sampling options.
    #[must_use]
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Sets the fallback models, tried in order.
    #[must_use]
    pub fn with_fallback_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Requires output matching `schema`.
    #[must_use]
    pub fn with_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.output.schema = Some(schema);
        self
    }

    /// Requires structured output without a specific schema.
    #[must_use]
    pub fn with_json_output(mut self, enabled: bool) -> Self {
        self.output.expect_json = enabled;
        self
    }

    /// Enables or disables model-assisted patching.
    #[must_use]
    pub fn with_patching(mut self, enabled: bool) -> Self {
        self.output.use_patching = enabled;
        self
    }

    /// Sets the patching attempt limit.
    #[must_use]
    pub fn with_max_patching_attempts(mut self, attempts: usize) -> Self {
        self.output.max_patching_attempts = attempts;
        self
    }

    /// Sets the patching instruction. `{schema}` is replaced by the schema description.
    #[must_use]
    pub fn with_patching_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.output.patching_prompt = prompt.into();
        self
    }

    /// Chooses between wrapping unrecoverable output as text and failing.
    #[must_use]
    pub fn with_fallback_to_text(mut self, enabled: bool) -> Self {
        self.output.fallback_to_text = enabled;
        self
    }

    /// Returns the fallback models.
    #[must_use]
    pub fn fallback_models(&self) -> &[String] {
        &self.fallback_models
    }

    async fn attempt(&self, model: String, prompt: &str) -> Result<Value, StepError> {
        let response = self
            .manager
            .generate_with_model(&model, prompt, &self.options)
            .await?;
        self.output
            .process(&self.manager, &model, &response.text, &self.options)
            .await
    }

    async fn run(&self, data: &Value, try_primary: bool) -> StepResult {
        let prompt = match self.template.render(data) {
            Ok(prompt) => prompt,
            Err(err) => {
                return StepResult::failed(
                    StepError::configuration(err.to_string()),
                    std::time::Duration::ZERO,
                    Some(self.model.clone()),
                )
            }
        };

        let rendered = prompt.as_str();
        run_with_fallbacks(
            &self.manager,
            &self.model,
            &self.fallback_models,
            try_primary,
            move |model| self.attempt(model, rendered),
        )
        .await
        .with_prompt(prompt.clone())
    }
}

#[async_trait]
impl Step for ModelStep {
    async fn execute(&self, data: &Value) -> StepResult {
        self.run(data, true).await
    }

    async fn get_fallback(&self, data: &Value) -> StepResult {
        self.run(data, false).await
    }

    fn required_inputs(&self) -> Vec<String> {
        self.template.placeholders()
    }

    fn model_name(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn kind(&self) -> StepKind {
        StepKind::Model
    }
}
