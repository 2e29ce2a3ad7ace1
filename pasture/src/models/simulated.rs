//! Synthetic backend used when no inference host is available.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::backend::{BackendError, BackendReply, ChatRequest, GenerateRequest, InferenceBackend};

const SIMULATED_MODELS: [&str; 4] = ["llama3", "mistral", "phi3", "gemma"];
const PREVIEW_CHARS: usize = 50;

/// Backend that answers every request with deterministic text.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    latency: Duration,
}

impl SimulatedBackend {
    /// Creates a backend that answers immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artificial delay to each generation.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

#[async_trait]
impl InferenceBackend for SimulatedBackend {
    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(SIMULATED_MODELS.iter().map(ToString::to_string).collect())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<BackendReply, BackendError> {
        self.pause().await;
        Ok(BackendReply {
            text: format!(
                "Simulated response from {} to: {}...",
                request.model,
                preview(&request.prompt)
            ),
            metadata: json!({ "simulated": true }),
        })
    }

    async fn chat(&self, request: &ChatRequest) -> Result<BackendReply, BackendError> {
        self.pause().await;
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        Ok(BackendReply {
            text: format!(
                "Simulated chat response from {} to: {}...",
                request.model,
                preview(last_user)
            ),
            metadata: json!({ "simulated": true }),
        })
    }

    async fn load(&self, _model: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn unload(&self, _model: &str) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn close(&self) {}
}
