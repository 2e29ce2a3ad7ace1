//! HTTP backend for an Ollama-compatible host.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

use super::backend::{BackendError, BackendReply, ChatRequest, GenerateRequest, InferenceBackend};

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Backend speaking `/api/tags`, `/api/generate` and `/api/chat`.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl OllamaBackend {
    /// Creates a backend for `base_url` with a per-request timeout.
    #[must_use]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Returns the host base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let url = format!("{}/api/{endpoint}", self.base_url);
        debug!(%url, %method, "Inference host request");

        let mut request = self.client.request(method, &url).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| BackendError::transient(format!("Undecodable response body: {err}")))
    }
}

/// Classifies a non-success HTTP status.
pub(crate) fn classify_status(status: StatusCode, detail: &str) -> BackendError {
    let message = format!("HTTP {}: {}", status.as_u16(), detail.trim());
    match status.as_u16() {
        408 | 429 | 500..=599 => BackendError::transient(message),
        404 => BackendError::not_found(message),
        _ => BackendError::fatal(message),
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_builder() {
        BackendError::fatal(format!("Invalid request: {err}"))
    } else if err.is_timeout() {
        BackendError::transient(format!("Request timed out: {err}"))
    } else {
        BackendError::transient(format!("Connection failed: {err}"))
    }
}

fn request_body(model: &str, options: &Value, format: Option<&Value>) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert("stream".to_string(), json!(false));
    if options.as_object().is_some_and(|options| !options.is_empty()) {
        body.insert("options".to_string(), options.clone());
    }
    if let Some(format) = format {
        body.insert("format".to_string(), format.clone());
    }
    body
}

/// Everything in the reply except the text itself.
fn reply_metadata(mut body: Value, text_key: &str) -> Value {
    if let Some(map) = body.as_object_mut() {
        map.remove(text_key);
    }
    body
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let body = self.request(Method::GET, "tags", None).await?;
        let tags: TagList = serde_json::from_value(body)
            .map_err(|err| BackendError::transient(format!("Unexpected model listing: {err}")))?;
        Ok(tags.models.into_iter().map(|entry| entry.name).collect())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<BackendReply, BackendError> {
        let mut body = request_body(&request.model, &request.options, request.format.as_ref());
        body.insert("prompt".to_string(), json!(request.prompt));

        let reply = self
            .request(Method::POST, "generate", Some(&Value::Object(body)))
            .await?;
        let text = reply
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(BackendReply {
            text,
            metadata: reply_metadata(reply, "response"),
        })
    }

    async fn chat(&self, request: &ChatRequest) -> Result<BackendReply, BackendError> {
        let mut body = request_body(&request.model, &request.options, request.format.as_ref());
        body.insert("messages".to_string(), json!(request.messages));

        let reply = self
            .request(Method::POST, "chat", Some(&Value::Object(body)))
            .await?;
        let text = reply
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(BackendReply {
            text,
            metadata: reply_metadata(reply, "message"),
        })
    }

    async fn load(&self, model: &str) -> Result<(), BackendError> {
        let body = json!({ "model": model, "prompt": "", "stream": false });
        self.request(Method::POST, "generate", Some(&body)).await?;
        Ok(())
    }

    async fn unload(&self, model: &str) -> Result<bool, BackendError> {
        let body = json!({ "model": model, "prompt": "", "keep_alive": 0, "stream": false });
        self.request(Method::POST, "generate", Some(&body)).await?;
        Ok(true)
    }

    async fn close(&self) {
        // Connections are pooled by the client and released on drop.
        debug!(base_url = %self.base_url, "Inference backend closed");
    }
}
