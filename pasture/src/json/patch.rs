//! Model-assisted repair of structured output.

use serde_json::{json, Value};
use tracing::{info, warn};

use super::repair::try_parse;
use super::schema::{validate_with_schema, Schema};
use crate::models::ModelManager;

/// Error marker for output that patching could not fix.
pub const PATCHING_FAILED: &str = "patching_failed";

const DEFAULT_TEMPERATURE: f64 = 0.7;
const MAX_PATCH_TEMPERATURE: f64 = 0.3;

/// Derives sampling options for patch calls: temperature is halved and capped at 0.3.
#[must_use]
pub fn patching_options(options: &Value) -> Value {
    let mut patched = match options {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    let temperature = patched
        .get("temperature")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_TEMPERATURE);
    patched.insert(
        "temperature".to_string(),
        json!((temperature * 0.5).min(MAX_PATCH_TEMPERATURE)),
    );
    Value::Object(patched)
}

/// Fills the `{schema}` placeholder of `instruction` and appends the text to fix.
#[must_use]
pub fn patch_prompt(instruction: &str, schema: Option<&dyn Schema>, previous_output: &str) -> String {
    let schema_text = schema
        .map(|schema| {
            let description = schema.describe();
            serde_json::to_string_pretty(&description).unwrap_or_else(|_| description.to_string())
        })
        .unwrap_or_default();
    format!(
        "{}\n\nPrevious output:\n{previous_output}",
        instruction.replace("{schema}", &schema_text)
    )
}

/// Asks `model` to correct `broken_text` until it parses and validates.
///
/// Each failed attempt's reply becomes the next attempt's input. Returns
/// `(true, value)` on success; otherwise `(false, best_attempt)`, where the
/// best attempt is the last parsed value or a wrapped reply carrying
/// `"error": "patching_failed"`.
pub async fn patch_json_with_model(
    manager: &ModelManager,
    model: &str,
    instruction: &str,
    broken_text: &str,
    schema: Option<&dyn Schema>,
    options: &Value,
    max_attempts: usize,
) -> (bool, Value) {
    let mut input = broken_text.to_string();
    let mut best = json!({ "response": broken_text, "error": PATCHING_FAILED });

    for attempt in 1..=max_attempts {
        info!(model, attempt, max_attempts, "JSON patching attempt");
        let prompt = patch_prompt(instruction, schema, &input);

        let reply = match manager.generate_with_model(model, &prompt, options).await {
            Ok(reply) => reply.text,
            Err(err) => {
                warn!(model, error = %err, "Patch call failed");
                return (
                    false,
                    json!({ "response": input, "error": PATCHING_FAILED, "details": err.to_string() }),
                );
            }
        };

        match try_parse(&reply) {
            Some(value) => match schema {
                Some(schema) => {
                    let (ok, validated) = validate_with_schema(&value, schema);
                    if ok {
                        info!(model, attempt, "Patched output validated");
                        return (true, validated);
                    }
                    warn!(model, attempt, "Patched output does not match schema");
                    best = value;
                }
                None => return (true, value),
            },
            None => {
                warn!(model, attempt, "Patch reply is not valid JSON");
                best = json!({ "response": reply, "error": PATCHING_FAILED });
            }
        }
        input = reply;
    }

    warn!(model, max_attempts, "JSON patching exhausted");
    (false, best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::{FieldType, ObjectSchema};
    use crate::testing::{test_config, BackendOp, ScriptedBackend};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const INSTRUCTION: &str = "Fix this to match:\n{schema}";

    fn score_schema() -> ObjectSchema {
        ObjectSchema::new().required("score", FieldType::Integer)
    }

    #[test]
    fn test_patching_options_lower_temperature() {
        assert_eq!(
            patching_options(&json!({"temperature": 0.4, "top_p": 0.9})),
            json!({"temperature": 0.2, "top_p": 0.9})
        );
        assert_eq!(patching_options(&json!({})), json!({"temperature": 0.3}));
    }

    #[test]
    fn test_patch_prompt_embeds_schema() {
        let prompt = patch_prompt(INSTRUCTION, Some(&score_schema()), "oops");
        assert!(prompt.starts_with("Fix this to match:\n{"));
        assert!(prompt.contains("\"score\""));
        assert!(prompt.ends_with("\n\nPrevious output:\noops"));
        assert_eq!(
            patch_prompt("Fix {schema}", None, "x"),
            "Fix \n\nPrevious output:\nx"
        );
    }

    #[tokio::test]
    async fn test_patch_feeds_previous_reply_forward() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .reply("m", "Sorry, I cannot do that")
                .reply("m", r#"{"score": "7"}"#),
        );
        let manager = ModelManager::new(test_config(), backend.clone());
        let schema = score_schema();

        let (patched, value) = patch_json_with_model(
            &manager,
            "m",
            INSTRUCTION,
            "score: seven",
            Some(&schema),
            &json!({}),
            3,
        )
        .await;

        assert!(patched);
        assert_eq!(value, json!({"score": 7}));

        let prompts: Vec<String> = backend
            .calls()
            .into_iter()
            .filter(|call| call.op == BackendOp::Generate)
            .filter_map(|call| call.prompt)
            .collect();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].ends_with("Previous output:\nscore: seven"));
        assert!(prompts[1].ends_with("Previous output:\nSorry, I cannot do that"));
    }

    #[tokio::test]
    async fn test_patch_exhaustion_returns_best_attempt() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .reply("m", r#"{"score": "high"}"#)
                .reply("m", "still not json"),
        );
        let manager = ModelManager::new(test_config(), backend.clone());
        let schema = score_schema();

        let (patched, value) =
            patch_json_with_model(&manager, "m", INSTRUCTION, "{", Some(&schema), &json!({}), 2).await;

        assert!(!patched);
        assert_eq!(value, json!({"response": "still not json", "error": PATCHING_FAILED}));
        assert_eq!(backend.generation_calls("m"), 2);
    }

    #[tokio::test]
    async fn test_patch_without_schema_accepts_any_structure() {
        let backend = Arc::new(ScriptedBackend::new().reply("m", "```json\n{\"ok\": true}\n```"));
        let manager = ModelManager::new(test_config(), backend);

        let (patched, value) =
            patch_json_with_model(&manager, "m", INSTRUCTION, "{ok", None, &json!({}), 1).await;
        assert!(patched);
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_zero_attempts_does_nothing() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = ModelManager::new(test_config(), backend.clone());
        let (patched, _) =
            patch_json_with_model(&manager, "m", INSTRUCTION, "{", None, &json!({}), 0).await;
        assert!(!patched);
        assert!(backend.calls().is_empty());
    }
}
