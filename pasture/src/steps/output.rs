//! Turning raw model text into step output.

use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::result::StepError;
use crate::config::JsonPatchingConfig;
use crate::errors::FailureKind;
use crate::json::{
    patch_json_with_model, patching_options, try_parse, validate_with_schema, wrap_text_as_json,
    Schema, EMPTY_RESPONSE,
};
use crate::models::ModelManager;

/// How a step validates and repairs what the model returns.
#[derive(Clone)]
pub struct OutputPolicy {
    pub(crate) schema: Option<Arc<dyn Schema>>,
    pub(crate) expect_json: bool,
    pub(crate) use_patching: bool,
    pub(crate) max_patching_attempts: usize,
    pub(crate) patching_prompt: String,
    pub(crate) fallback_to_text: bool,
}

impl fmt::Debug for OutputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPolicy")
            .field("schema", &self.schema)
            .field("expect_json", &self.expect_json)
            .field("use_patching", &self.use_patching)
            .field("max_patching_attempts", &self.max_patching_attempts)
            .field("fallback_to_text", &self.fallback_to_text)
            .finish_non_exhaustive()
    }
}

impl OutputPolicy {
    /// Plain-text output with patching settings taken from `config`.
    #[must_use]
    pub fn from_config(config: &JsonPatchingConfig) -> Self {
        Self {
            schema: None,
            expect_json: false,
            use_patching: config.enabled,
            max_patching_attempts: config.max_attempts,
            patching_prompt: config.patching_prompt.clone(),
            fallback_to_text: config.fallback_to_text,
        }
    }

    /// Returns true if the output must be structured.
    #[must_use]
    pub fn wants_structure(&self) -> bool {
        self.schema.is_some() || self.expect_json
    }

    /// The chat `format` hint for this policy.
    #[must_use]
    pub fn format_hint(&self) -> Option<Value> {
        match &self.schema {
            Some(schema) => Some(schema.describe()),
            None if self.expect_json => Some(json!("json")),
            None => None,
        }
    }

    fn plain(text: &str) -> Result<Value, StepError> {
        let wrapped = wrap_text_as_json(text);
        if wrapped.get("error").and_then(Value::as_str) == Some(EMPTY_RESPONSE) {
            return Err(StepError::new(FailureKind::Quality, "Model returned an empty response"));
        }
        Ok(wrapped)
    }

    /// Parses, validates and if needed patches `text` produced by `model`.
    ///
    /// # Errors
    ///
    /// Returns a `Quality` error when structured output was required and
    /// could not be recovered and text fallback is disabled.
    pub async fn process(
        &self,
        manager: &ModelManager,
        model: &str,
        text: &str,
        options: &Value,
    ) -> Result<Value, StepError> {
        if !self.wants_structure() {
            return Self::plain(text);
        }

        let schema = self.schema.as_deref();
        if let Some(value) = try_parse(text) {
            match schema {
                None => return Ok(value),
                Some(schema) => {
                    let (ok, validated) = validate_with_schema(&value, schema);
                    if ok {
                        return Ok(validated);
                    }
                    debug!(model, "Output does not match schema");
                }
            }
        } else {
            debug!(model, "Output is not valid JSON");
        }

        if self.use_patching && self.max_patching_attempts > 0 {
            let (patched, value) = patch_json_with_model(
                manager,
                model,
                &self.patching_prompt,
                text,
                schema,
                &patching_options(options),
                self.max_patching_attempts,
            )
            .await;
            if patched {
                return Ok(value);
            }
        }

        if self.fallback_to_text {
            warn!(model, "Falling back to text output");
            return Self::plain(text);
        }
        Err(StepError::new(
            FailureKind::Quality,
            "Output could not be parsed into the expected structure",
        ))
    }
}
