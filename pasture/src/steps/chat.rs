//! Chat completion step.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::output::OutputPolicy;
use super::result::{StepError, StepResult};
use super::template::{PromptTemplate, TemplateError};
use super::{run_with_fallbacks, upstream_context, Step, StepKind};
use crate::json::Schema;
use crate::models::{ChatMessage, ModelManager};

/// Builds a conversation from the step input and sends it to a chat model.
///
/// If the input carries a `messages` array it is used verbatim. Otherwise a
/// single user message is rendered from the user template, preceded by a
/// `Context:` system message summarizing upstream responses when the step
/// has no system prompt of its own.
#[derive(Debug, Clone)]
pub struct ChatModelStep {
    manager: Arc<ModelManager>,
    model: String,
    system_prompt: Option<PromptTemplate>,
    user_template: PromptTemplate,
    options: Value,
    fallback_models: Vec<String>,
    output: OutputPolicy,
}

impl ChatModelStep {
    /// Creates a chat step for `model`.
    #[must_use]
    pub fn new(manager: Arc<ModelManager>, model: impl Into<String>) -> Self {
        let output = OutputPolicy::from_config(&manager.config().json_patching);
        Self {
            manager,
            model: model.into(),
            system_prompt: None,
            user_template: PromptTemplate::field("query"),
            options: json!({ "temperature": 0.7 }),
            fallback_models: Vec::new(),
            output,
        }
    }

    /// Sets the system prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is malformed.
    pub fn with_system_prompt(mut self, template: &str) -> Result<Self, TemplateError> {
        self.system_prompt = Some(PromptTemplate::parse(template)?);
        Ok(self)
    }

    /// Sets the user message template. The default is `{query}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is malformed.
    pub fn with_user_template(mut self, template: &str) -> Result<Self, TemplateError> {
        self.user_template = PromptTemplate::parse(template)?;
        Ok(self)
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

    /// Requires output matching `schema`. The schema is also sent as the `format` hint.
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

    /// Sets the patching instruction.
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

    /// Builds the message list sent to the model.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a template cannot be rendered or
    /// `messages` is malformed.
    pub fn prepare_messages(&self, data: &Value) -> Result<Vec<ChatMessage>, StepError> {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            let content = system
                .render(data)
                .map_err(|err| StepError::configuration(err.to_string()))?;
            messages.push(ChatMessage::system(content));
        }

        if let Some(incoming) = data.get("messages").filter(|value| value.is_array()) {
            let incoming: Vec<ChatMessage> = serde_json::from_value(incoming.clone())
                .map_err(|err| StepError::configuration(format!("Invalid messages: {err}")))?;
            let keep_system = self.system_prompt.is_none();
            messages.extend(
                incoming
                    .into_iter()
                    .filter(|message| keep_system || !message.is_system()),
            );
            return Ok(messages);
        }

        let content = self
            .user_template
            .render(data)
            .map_err(|err| StepError::configuration(err.to_string()))?;
        messages.push(ChatMessage::user(content));

        if self.system_prompt.is_none() {
            let context = upstream_context(data);
            if !context.is_empty() {
                messages.insert(
                    0,
                    ChatMessage::system(format!("Context:\n{}", context.join("\n\n"))),
                );
            }
        }
        Ok(messages)
    }

    async fn attempt(&self, model: String, messages: &[ChatMessage]) -> Result<Value, StepError> {
        let format = self.output.format_hint();
        let response = self
            .manager
            .generate_with_chat(&model, messages, &self.options, format.as_ref())
            .await?;
        self.output
            .process(&self.manager, &model, &response.text, &self.options)
            .await
    }

    async fn run(&self, data: &Value, try_primary: bool) -> StepResult {
        let messages = match self.prepare_messages(data) {
            Ok(messages) => messages,
            Err(err) => {
                return StepResult::failed(err, std::time::Duration::ZERO, Some(self.model.clone()))
            }
        };

        let conversation = messages.as_slice();
        let result = run_with_fallbacks(
            &self.manager,
            &self.model,
            &self.fallback_models,
            try_primary,
            move |model| self.attempt(model, conversation),
        )
        .await;

        match messages.iter().rev().find(|message| message.role == "user") {
            Some(last_user) => result.with_prompt(last_user.content.clone()),
            None => result,
        }
    }
}

#[async_trait]
impl Step for ChatModelStep {
    async fn execute(&self, data: &Value) -> StepResult {
        self.run(data, true).await
    }

    async fn get_fallback(&self, data: &Value) -> StepResult {
        self.run(data, false).await
    }

    fn required_inputs(&self) -> Vec<String> {
        self.system_prompt
            .as_ref()
            .map(PromptTemplate::placeholders)
            .unwrap_or_default()
    }

    fn model_name(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn kind(&self) -> StepKind {
        StepKind::Chat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepStatus;
    use crate::testing::{test_config, BackendOp, ScriptedBackend};
    use pretty_assertions::assert_eq;

    fn step() -> ChatModelStep {
        let manager = Arc::new(ModelManager::new(test_config(), Arc::new(ScriptedBackend::new())));
        ChatModelStep::new(manager, "llama3")
    }

    #[test]
    fn test_query_becomes_user_message() {
        let messages = step().prepare_messages(&json!({"query": "2+2"})).unwrap();
        assert_eq!(messages, vec![ChatMessage::user("2+2")]);
    }

    #[test]
    fn test_upstream_context_without_system_prompt() {
        let messages = step()
            .prepare_messages(&json!({
                "query": "summarize",
                "economic": {"response": "growth"},
                "social": {"response": "calm"},
            }))
            .unwrap();
        assert_eq!(
            messages,
            vec![
                ChatMessage::system("Context:\nEconomic analysis: growth\n\nSocial analysis: calm"),
                ChatMessage::user("summarize"),
            ]
        );
    }

    #[test]
    fn test_system_prompt_replaces_context_and_incoming_system() {
        let step = step().with_system_prompt("You are {persona}.").unwrap();
        let messages = step
            .prepare_messages(&json!({
                "persona": "terse",
                "messages": [
                    {"role": "system", "content": "ignored"},
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"},
                ],
            }))
            .unwrap();
        assert_eq!(
            messages,
            vec![
                ChatMessage::system("You are terse."),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ]
        );
        assert_eq!(step.required_inputs(), vec!["persona".to_string()]);
    }

    #[test]
    fn test_incoming_messages_kept_verbatim_without_system_prompt() {
        let messages = step()
            .prepare_messages(&json!({
                "messages": [{"role": "system", "content": "be kind"}, {"role": "user", "content": "hi"}],
                "economic": {"response": "ignored"},
            }))
            .unwrap();
        assert_eq!(messages, vec![ChatMessage::system("be kind"), ChatMessage::user("hi")]);
    }

    #[test]
    fn test_missing_query_is_configuration_error() {
        let err = step().prepare_messages(&json!({})).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_execute_sends_conversation_and_format() {
        let backend = Arc::new(ScriptedBackend::new().reply("llama3", r#"{"answer": 4}"#));
        let manager = Arc::new(ModelManager::new(test_config(), backend.clone()));
        let step = ChatModelStep::new(manager, "llama3").with_json_output(true);

        let result = step.execute(&json!({"query": "2+2"})).await;

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.output, json!({"answer": 4}));
        assert_eq!(result.prompt.as_deref(), Some("2+2"));
        let call = &backend.calls()[0];
        assert_eq!(call.op, BackendOp::Chat);
        assert_eq!(call.messages, vec![ChatMessage::user("2+2")]);
    }
}
