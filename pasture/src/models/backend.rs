//! The pluggable inference host interface.
//!
//! The resource manager never speaks a wire format directly. It drives an
//! [`InferenceBackend`], which may be a real host ([`super::OllamaBackend`]),
//! the synthetic [`super::SimulatedBackend`], or a test double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::errors::FailureKind;

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message with an arbitrary role.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Returns true for system messages.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// A single-prompt completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateRequest {
    /// Target model.
    pub model: String,
    /// Prompt text.
    pub prompt: String,
    /// Sampling options, passed through verbatim.
    pub options: Value,
    /// Optional structured-output hint.
    pub format: Option<Value>,
}

/// A chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    /// Target model.
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Sampling options, passed through verbatim.
    pub options: Value,
    /// Optional structured-output hint.
    pub format: Option<Value>,
}

/// Text returned by the host plus whatever metadata it reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendReply {
    /// Generated text.
    pub text: String,
    /// Host metadata such as token counts and durations.
    #[serde(default)]
    pub metadata: Value,
}

impl BackendReply {
    /// Creates a reply without metadata.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Value::Null,
        }
    }
}

/// A classified transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    /// Failure classification.
    pub kind: FailureKind,
    /// Detail from the host or transport.
    pub message: String,
}

impl BackendError {
    /// Creates a backend error.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A retryable failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// The host does not know the model.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    /// The host rejected the request.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }
}

/// Operations the resource manager needs from an inference host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Lists every model the host can serve.
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    /// Runs a single-prompt completion.
    async fn generate(&self, request: &GenerateRequest) -> Result<BackendReply, BackendError>;

    /// Runs a chat completion.
    async fn chat(&self, request: &ChatRequest) -> Result<BackendReply, BackendError>;

    /// Asks the host to make `model` resident.
    async fn load(&self, model: &str) -> Result<(), BackendError>;

    /// Asks the host to release `model`. Returns the host's acknowledgement.
    async fn unload(&self, model: &str) -> Result<bool, BackendError>;

    /// Releases transport resources. Must be idempotent.
    async fn close(&self);
}
