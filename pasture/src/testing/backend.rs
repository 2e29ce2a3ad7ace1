//! A scriptable in-memory inference backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::models::{
    BackendError, BackendReply, ChatMessage, ChatRequest, GenerateRequest, InferenceBackend,
};

/// Which backend operation was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    /// `list_models`
    List,
    /// `generate`
    Generate,
    /// `chat`
    Chat,
    /// `load`
    Load,
    /// `unload`
    Unload,
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    /// The operation.
    pub op: BackendOp,
    /// Target model (empty for listings).
    pub model: String,
    /// Prompt text for generations.
    pub prompt: Option<String>,
    /// Messages for chats.
    pub messages: Vec<ChatMessage>,
    /// Sampling options sent.
    pub options: serde_json::Value,
}

/// Backend whose replies are queued per model.
///
/// Queued replies are consumed in order. When a model's queue is empty
/// the backend falls back to its standing failure, if any, and otherwise
/// echoes the prompt.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    models: Vec<String>,
    latency: Duration,
    queues: Mutex<HashMap<String, VecDeque<Result<String, BackendError>>>>,
    standing_failures: Mutex<HashMap<String, BackendError>>,
    load_failures: Mutex<HashMap<String, BackendError>>,
    unload_failures: Mutex<HashSet<String>>,
    calls: Mutex<Vec<BackendCall>>,
    loads_in_flight: AtomicUsize,
    max_loads_in_flight: AtomicUsize,
    generations_in_flight: AtomicUsize,
    max_generations_in_flight: AtomicUsize,
    closes: AtomicUsize,
}

impl ScriptedBackend {
    /// Creates an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the models returned by `list_models`.
    #[must_use]
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Delays every load and generation.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues a reply for `model`.
    #[must_use]
    pub fn reply(self, model: &str, text: impl Into<String>) -> Self {
        self.push(model, Ok(text.into()));
        self
    }

    /// Queues a failure for `model`.
    #[must_use]
    pub fn fail(self, model: &str, error: BackendError) -> Self {
        self.push(model, Err(error));
        self
    }

    /// Makes every unscripted call to `model` fail.
    #[must_use]
    pub fn always_fail(self, model: &str, error: BackendError) -> Self {
        self.standing_failures.lock().insert(model.to_string(), error);
        self
    }

    /// Makes loading `model` fail.
    #[must_use]
    pub fn fail_load(self, model: &str, error: BackendError) -> Self {
        self.load_failures.lock().insert(model.to_string(), error);
        self
    }

    /// Makes unloading `model` fail.
    #[must_use]
    pub fn fail_unload(self, model: &str) -> Self {
        self.unload_failures.lock().insert(model.to_string());
        self
    }

    /// Queues a reply after construction.
    pub fn push(&self, model: &str, reply: Result<String, BackendError>) {
        self.queues
            .lock()
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Counts generate and chat calls for `model`.
    #[must_use]
    pub fn generation_calls(&self, model: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| {
                call.model == model && matches!(call.op, BackendOp::Generate | BackendOp::Chat)
            })
            .count()
    }

    /// Peak number of concurrent loads.
    #[must_use]
    pub fn max_in_flight_loads(&self) -> usize {
        self.max_loads_in_flight.load(Ordering::SeqCst)
    }

    /// Peak number of concurrent generations.
    #[must_use]
    pub fn max_in_flight_generations(&self) -> usize {
        self.max_generations_in_flight.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn next_reply(&self, model: &str, echo: &str) -> Result<BackendReply, BackendError> {
        let queued = self
            .queues
            .lock()
            .get_mut(model)
            .and_then(VecDeque::pop_front);
        let text = match queued {
            Some(reply) => reply?,
            None => {
                if let Some(error) = self.standing_failures.lock().get(model) {
                    return Err(error.clone());
                }
                format!("{model} answered: {echo}")
            }
        };
        Ok(BackendReply::text(text))
    }

    async fn generation(&self, model: &str, echo: &str) -> Result<BackendReply, BackendError> {
        let current = self.generations_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_generations_in_flight.fetch_max(current, Ordering::SeqCst);
        self.pause().await;
        let reply = self.next_reply(model, echo);
        self.generations_in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        self.record(BackendCall {
            op: BackendOp::List,
            model: String::new(),
            prompt: None,
            messages: Vec::new(),
            options: serde_json::Value::Null,
        });
        Ok(self.models.clone())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<BackendReply, BackendError> {
        self.record(BackendCall {
            op: BackendOp::Generate,
            model: request.model.clone(),
            prompt: Some(request.prompt.clone()),
            messages: Vec::new(),
            options: request.options.clone(),
        });
        self.generation(&request.model, &request.prompt).await
    }

    async fn chat(&self, request: &ChatRequest) -> Result<BackendReply, BackendError> {
        self.record(BackendCall {
            op: BackendOp::Chat,
            model: request.model.clone(),
            prompt: None,
            messages: request.messages.clone(),
            options: request.options.clone(),
        });
        let last = request
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        self.generation(&request.model, &last).await
    }

    async fn load(&self, model: &str) -> Result<(), BackendError> {
        self.record(BackendCall {
            op: BackendOp::Load,
            model: model.to_string(),
            prompt: None,
            messages: Vec::new(),
            options: serde_json::Value::Null,
        });
        let current = self.loads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_loads_in_flight.fetch_max(current, Ordering::SeqCst);
        self.pause().await;
        self.loads_in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.load_failures.lock().get(model) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn unload(&self, model: &str) -> Result<bool, BackendError> {
        self.record(BackendCall {
            op: BackendOp::Unload,
            model: model.to_string(),
            prompt: None,
            messages: Vec::new(),
            options: serde_json::Value::Null,
        });
        if self.unload_failures.lock().contains(model) {
            return Err(BackendError::transient("unload rejected"));
        }
        Ok(true)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
