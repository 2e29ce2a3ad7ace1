//! The model resource manager.
//!
//! Owns every call to the inference host: cache lookup, optional preload
//! under the residency lock, retried transport, quality check and cache
//! write-through. Health is tracked per model so steps can pick fallbacks.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::{
    BackendError, BackendReply, ChatMessage, ChatRequest, GenerateRequest, InferenceBackend,
};
use super::retry::{with_retry, Attempted, RetryPolicy};
use super::simulated::SimulatedBackend;
use super::status::{ModelState, ModelStatus, ModelStatusReport};
use crate::cache::{fingerprint, FileCache, ResponseCache};
use crate::config::{Config, ConfigError};
use crate::errors::{FailureKind, ModelError};
use crate::utils::duration_secs;

const HEALTH_PROBE_PROMPT: &str = "Hello";
const EXCLUDED_MODEL_TERMS: [&str; 2] = ["embed", "whisper"];
const LISTING: &str = "*";

/// A successful model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The model that answered.
    pub model: String,
    /// Generated text.
    pub text: String,
    /// Wall time including retries.
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    /// Host metadata.
    pub metadata: Value,
    /// True when served from the cache.
    pub cached: bool,
    /// Transport attempts made (zero on a cache hit).
    pub attempts: usize,
}

impl ModelResponse {
    /// Returns the wrapped form `{"response": text, ...}` used by steps.
    #[must_use]
    pub fn to_envelope(&self) -> Value {
        json!({
            "response": self.text,
            "model": self.model,
            "execution_time": self.elapsed.as_secs_f64(),
            "cached": self.cached,
        })
    }
}

enum Call<'a> {
    Generate(&'a GenerateRequest),
    Chat(&'a ChatRequest),
}

impl Call<'_> {
    fn model(&self) -> &str {
        match self {
            Self::Generate(request) => &request.model,
            Self::Chat(request) => &request.model,
        }
    }

    fn fingerprint(&self) -> String {
        match self {
            Self::Generate(request) => fingerprint(
                "generate",
                &request.model,
                &json!(request.prompt),
                &request.options,
                request.format.as_ref(),
            ),
            Self::Chat(request) => fingerprint(
                "chat",
                &request.model,
                &json!(request.messages),
                &request.options,
                request.format.as_ref(),
            ),
        }
    }
}

/// Coordinates model lifecycle, health and generation.
///
/// Safe to share behind an `Arc` across concurrently running steps.
pub struct ModelManager {
    config: Config,
    backend: Arc<dyn InferenceBackend>,
    cache: Option<Arc<dyn ResponseCache>>,
    policy: RetryPolicy,
    statuses: DashMap<String, ModelStatus>,
    residency: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelManager")
            .field("policy", &self.policy)
            .field("cache", &self.cache)
            .field("models", &self.statuses.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ModelManager {
    /// Creates a manager over `backend`.
    ///
    /// A [`FileCache`] is attached when caching is enabled in `config`.
    #[must_use]
    pub fn new(config: Config, backend: Arc<dyn InferenceBackend>) -> Self {
        let cache: Option<Arc<dyn ResponseCache>> = if config.cache.enabled {
            Some(Arc::new(FileCache::from_config(&config.cache)))
        } else {
            None
        };
        Self {
            policy: config.retry_policy(),
            config,
            backend,
            cache,
            statuses: DashMap::new(),
            residency: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a manager with the backend implied by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no real backend
    /// is compiled in while simulation mode is off.
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.simulation_mode {
            info!("Simulation mode enabled, using synthetic backend");
            return Ok(Self::new(config, Arc::new(SimulatedBackend::new())));
        }

        #[cfg(feature = "ollama")]
        {
            let backend =
                super::ollama::OllamaBackend::new(config.api_base.clone(), config.request_timeout());
            Ok(Self::new(config, Arc::new(backend)))
        }

        #[cfg(not(feature = "ollama"))]
        {
            Err(ConfigError::Invalid {
                field: "simulation_mode",
                reason: "no inference backend is compiled in; enable the `ollama` feature".to_string(),
            })
        }
    }

    /// Replaces the response cache. `None` disables caching.
    #[must_use]
    pub fn with_cache(mut self, cache: Option<Arc<dyn ResponseCache>>) -> Self {
        self.cache = cache;
        self
    }

    /// Replaces the transport retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the active retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the response cache, if any.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<dyn ResponseCache>> {
        self.cache.as_ref()
    }

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn update_status<R>(&self, model: &str, update: impl FnOnce(&mut ModelStatus) -> R) -> R {
        let mut status = self
            .statuses
            .entry(model.to_string())
            .or_insert_with(|| ModelStatus::new(model));
        update(&mut status)
    }

    /// Returns a snapshot of one model's status.
    #[must_use]
    pub fn status(&self, model: &str) -> Option<ModelStatus> {
        self.statuses.get(model).map(|status| status.clone())
    }

    /// Returns true unless the model is marked unhealthy.
    #[must_use]
    pub fn is_healthy(&self, model: &str) -> bool {
        self.statuses
            .get(model)
            .map_or(true, |status| status.is_healthy())
    }

    /// Quarantines a model so fallback selection skips it until it next succeeds.
    pub fn mark_unhealthy(&self, model: &str) {
        self.update_status(model, |status| status.state = ModelState::Unhealthy);
    }

    fn record_failure(&self, model: &str, error: &BackendError) {
        let threshold = self.config.fallback_threshold;
        let (tripped, failures) = self.update_status(model, |status| {
            (status.record_failure(threshold), status.consecutive_failures)
        });
        debug!(model, failures, kind = %error.kind, "Model call failed");
        if tripped {
            warn!(model, failures, threshold, "Model marked unhealthy");
        }
    }

    async fn record_success(&self, model: &str) {
        let resident = self.residency.lock().await.iter().any(|name| name == model);
        let recovered_state = if resident {
            ModelState::Loaded
        } else {
            ModelState::Unknown
        };
        let was_unhealthy = self.update_status(model, |status| {
            let was_unhealthy = !status.is_healthy();
            status.record_success(recovered_state);
            was_unhealthy
        });
        if was_unhealthy {
            info!(model, "Model recovered");
        }
    }

    fn closed_error(model: &str) -> ModelError {
        ModelError::new(FailureKind::Fatal, model, "Model manager is closed")
    }

    async fn timed<T>(
        &self,
        future: impl std::future::Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::transient(format!(
                "Request timed out after {:.1}s",
                timeout.as_secs_f64()
            ))),
        }
    }

    /// Lists text-generation models known to the host.
    ///
    /// Embedding and speech models are filtered out.
    pub async fn get_available_models(&self) -> Result<Vec<String>, ModelError> {
        if self.is_closed() {
            return Err(Self::closed_error(LISTING));
        }
        let listed = with_retry(&self.policy, "list_models", move |_| async move {
            self.timed(self.backend.list_models()).await
        })
        .await
        .map_err(|Attempted { value, attempts }| {
            warn!(error = %value, "Failed to list models");
            ModelError::new(value.kind, LISTING, value.message).with_attempts(attempts)
        })?;

        let models: Vec<String> = listed
            .value
            .into_iter()
            .filter(|name| {
                let lower = name.to_lowercase();
                !EXCLUDED_MODEL_TERMS.iter().any(|term| lower.contains(term))
            })
            .collect();
        info!(count = models.len(), "Found compatible models");
        Ok(models)
    }

    /// Probes `model` with a minimal generation.
    ///
    /// Success clears the failure counter; failure increments it.
    pub async fn check_model_health(&self, model: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        let probe = GenerateRequest {
            model: model.to_string(),
            prompt: HEALTH_PROBE_PROMPT.to_string(),
            options: json!({}),
            format: None,
        };
        let result = self.timed(self.backend.generate(&probe)).await;
        self.update_status(model, |status| status.last_checked = Some(Utc::now()));

        match result {
            Ok(_) => {
                self.record_success(model).await;
                debug!(model, "Health check passed");
                true
            }
            Err(err) => {
                warn!(model, error = %err, "Health check failed");
                self.record_failure(model, &err);
                false
            }
        }
    }

    async fn ensure_loaded(&self, model: &str) -> Result<(), BackendError> {
        let mut resident = self.residency.lock().await;
        if resident.iter().any(|name| name == model) {
            return Ok(());
        }

        if self.config.sequential_execution {
            for other in std::mem::take(&mut *resident) {
                self.release(&other).await;
            }
        }

        self.update_status(model, |status| status.state = ModelState::Loading);
        info!(model, "Loading model");
        let loaded = with_retry(&self.policy, model, move |_| async move {
            let result = self.timed(self.backend.load(model)).await;
            if let Err(err) = &result {
                self.record_failure(model, err);
            }
            result
        })
        .await;

        match loaded {
            Ok(_) => {
                resident.push(model.to_string());
                self.update_status(model, |status| {
                    status.state = ModelState::Loaded;
                    status.consecutive_failures = 0;
                });
                Ok(())
            }
            Err(Attempted { value, .. }) => {
                self.update_status(model, |status| {
                    if status.state == ModelState::Loading {
                        status.state = ModelState::Unknown;
                    }
                });
                Err(value)
            }
        }
    }

    /// Sends an unload request and marks the model unloaded. Caller holds the residency lock.
    async fn release(&self, model: &str) -> bool {
        info!(model, "Unloading model");
        let acknowledged = match self.timed(self.backend.unload(model)).await {
            Ok(ack) => ack,
            Err(err) => {
                warn!(model, error = %err, "Unload request failed");
                false
            }
        };
        self.update_status(model, |status| {
            if status.state != ModelState::Unhealthy {
                status.state = ModelState::Unloaded;
            }
        });
        acknowledged
    }

    /// Makes `model` resident on the host.
    ///
    /// With sequential execution enabled, every other resident model is
    /// unloaded first, inside the same critical section.
    pub async fn preload_model(&self, model: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.ensure_loaded(model).await {
            Ok(()) => true,
            Err(err) => {
                warn!(model, error = %err, "Failed to preload model");
                false
            }
        }
    }

    /// Asks the host to release `model`.
    ///
    /// Local state always becomes `Unloaded`; the return value is the
    /// host's acknowledgement.
    pub async fn unload_model(&self, model: &str) -> bool {
        let mut resident = self.residency.lock().await;
        resident.retain(|name| name != model);
        self.release(model).await
    }

    /// Generates a completion for `prompt`.
    pub async fn generate_with_model(
        &self,
        model: &str,
        prompt: &str,
        options: &Value,
    ) -> Result<ModelResponse, ModelError> {
        let request = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            options: options.clone(),
            format: None,
        };
        self.complete(Call::Generate(&request)).await
    }

    /// Generates a chat completion.
    ///
    /// `format` is passed to the host as a structured-output hint.
    pub async fn generate_with_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Value,
        format: Option<&Value>,
    ) -> Result<ModelResponse, ModelError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            options: options.clone(),
            format: format.cloned(),
        };
        self.complete(Call::Chat(&request)).await
    }

    async fn cached_reply(&self, key: &str) -> Option<BackendReply> {
        let cache = self.cache.as_ref()?;
        let value = cache.get(key).await?;
        match serde_json::from_value::<BackendReply>(value) {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable cached reply");
                None
            }
        }
    }

    async fn store_reply(&self, key: &str, reply: &BackendReply) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let stored = match serde_json::to_value(reply) {
            Ok(value) => cache.set(key, value, None).await.map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        if let Err(err) = stored {
            warn!(error = %err, "Failed to cache model reply");
        }
    }

    async fn complete(&self, call: Call<'_>) -> Result<ModelResponse, ModelError> {
        let model = call.model();
        if self.is_closed() {
            return Err(Self::closed_error(model));
        }
        let started = Instant::now();
        let key = call.fingerprint();

        if let Some(reply) = self.cached_reply(&key).await {
            debug!(model, "Using cached response");
            return Ok(ModelResponse {
                model: model.to_string(),
                text: reply.text,
                elapsed: started.elapsed(),
                metadata: reply.metadata,
                cached: true,
                attempts: 0,
            });
        }

        self.update_status(model, |status| status.last_used = Some(Utc::now()));
        if self.config.preload_models {
            if let Err(err) = self.ensure_loaded(model).await {
                warn!(model, error = %err, "Failed to load model");
                return Err(ModelError::new(
                    err.kind,
                    model,
                    format!("Failed to load model: {}", err.message),
                ));
            }
        }

        let call = &call;
        let outcome = with_retry(&self.policy, model, move |attempt| async move {
            debug!(model, attempt, "Calling model");
            let result = match call {
                Call::Generate(request) => self.timed(self.backend.generate(request)).await,
                Call::Chat(request) => self.timed(self.backend.chat(request)).await,
            };
            if let Err(err) = &result {
                self.record_failure(model, err);
            }
            result
        })
        .await;

        let Attempted {
            value: reply,
            attempts,
        } = outcome.map_err(|Attempted { value, attempts }| {
            warn!(model, attempts, error = %value, "Model call failed");
            ModelError::new(value.kind, model, value.message).with_attempts(attempts)
        })?;
        self.record_success(model).await;

        let length = reply.text.trim().chars().count();
        if length < self.config.min_response_length {
            warn!(model, length, minimum = self.config.min_response_length, "Response too short");
            return Err(ModelError::new(
                FailureKind::Quality,
                model,
                format!(
                    "Response too short: {length} chars (minimum {})",
                    self.config.min_response_length
                ),
            )
            .with_attempts(attempts));
        }

        if self.config.verbose_output {
            let preview: String = reply.text.chars().take(100).collect();
            info!(model, %preview, "Response preview");
        }
        self.store_reply(&key, &reply).await;

        Ok(ModelResponse {
            model: model.to_string(),
            text: reply.text,
            elapsed: started.elapsed(),
            metadata: reply.metadata,
            cached: false,
            attempts,
        })
    }

    /// Picks the first candidate that is neither `failed_model` nor unhealthy.
    ///
    /// Candidates are considered in the caller's order.
    #[must_use]
    pub fn get_fallback_model(&self, failed_model: &str, candidates: &[String]) -> Option<String> {
        let choice = candidates
            .iter()
            .find(|name| name.as_str() != failed_model && self.is_healthy(name))
            .cloned();
        match &choice {
            Some(model) => debug!(failed_model, fallback = %model, "Selected fallback model"),
            None => warn!(failed_model, "No healthy fallback model available"),
        }
        choice
    }

    /// Returns resident models and every tracked status.
    pub async fn status_report(&self) -> ModelStatusReport {
        let resident_models = self.residency.lock().await.clone();
        let model_statuses: BTreeMap<String, ModelStatus> = self
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        ModelStatusReport {
            resident_models,
            model_statuses,
        }
    }

    /// Releases backend resources. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backend.close().await;
        info!("Model manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::models::backend::MockInferenceBackend;
    use crate::testing::{test_config, BackendOp, ScriptedBackend};
    use pretty_assertions::assert_eq;

    fn manager(backend: ScriptedBackend) -> (ModelManager, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        (ModelManager::new(test_config(), backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_generate_success() {
        let (manager, _) = manager(ScriptedBackend::new().reply("m1", "hello there"));
        let response = manager
            .generate_with_model("m1", "hi", &json!({}))
            .await
            .unwrap();
        assert_eq!(response.text, "hello there");
        assert_eq!(response.attempts, 1);
        assert!(!response.cached);
        assert_eq!(response.to_envelope()["response"], json!("hello there"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (manager, backend) = manager(
            ScriptedBackend::new()
                .fail("m1", BackendError::transient("503"))
                .fail("m1", BackendError::transient("timeout"))
                .reply("m1", "third time lucky"),
        );
        let response = manager
            .generate_with_model("m1", "hi", &json!({}))
            .await
            .unwrap();
        assert_eq!(response.attempts, 3);
        assert_eq!(backend.generation_calls("m1"), 3);
        assert_eq!(manager.status("m1").unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_retries_exhaust_and_mark_unhealthy() {
        let (manager, backend) = manager(
            ScriptedBackend::new().always_fail("m1", BackendError::transient("connection refused")),
        );
        let err = manager
            .generate_with_model("m1", "hi", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(err.attempts, 3);
        assert_eq!(backend.generation_calls("m1"), 3);

        // Three failures exceed the default threshold of two.
        let status = manager.status("m1").unwrap();
        assert_eq!(status.state, ModelState::Unhealthy);
        assert_eq!(status.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let (manager, backend) =
            manager(ScriptedBackend::new().fail("ghost", BackendError::not_found("HTTP 404")));
        let err = manager
            .generate_with_model("ghost", "hi", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NotFound);
        assert_eq!(err.attempts, 1);
        assert_eq!(backend.generation_calls("ghost"), 1);
    }

    #[tokio::test]
    async fn test_short_response_is_quality_failure() {
        let backend = Arc::new(ScriptedBackend::new().reply("m1", "  ok "));
        let manager = ModelManager::new(test_config().with_min_response_length(10), backend.clone());
        let err = manager
            .generate_with_model("m1", "hi", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Quality);
        assert_eq!(backend.generation_calls("m1"), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let backend = Arc::new(ScriptedBackend::new().reply("m1", "first answer"));
        let manager = ModelManager::new(test_config(), backend.clone())
            .with_cache(Some(Arc::new(InMemoryCache::new())));

        let options = json!({"temperature": 0.2});
        let first = manager.generate_with_model("m1", "q", &options).await.unwrap();
        let second = manager.generate_with_model("m1", "q", &options).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.text, "first answer");
        assert_eq!(second.attempts, 0);
        assert_eq!(backend.generation_calls("m1"), 1);

        let other = manager.generate_with_model("m1", "different", &options).await.unwrap();
        assert!(!other.cached);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail("m1", BackendError::fatal("HTTP 400"))
                .reply("m1", "recovered"),
        );
        let manager = ModelManager::new(test_config(), backend.clone())
            .with_cache(Some(Arc::new(InMemoryCache::new())));

        assert!(manager.generate_with_model("m1", "q", &json!({})).await.is_err());
        let response = manager.generate_with_model("m1", "q", &json!({})).await.unwrap();
        assert!(!response.cached);
        assert_eq!(response.text, "recovered");
    }

    #[tokio::test]
    async fn test_fallback_selection_skips_unhealthy() {
        let (manager, _) = manager(ScriptedBackend::new());
        let candidates: Vec<String> = ["m1", "m2", "m3"].iter().map(ToString::to_string).collect();

        manager.mark_unhealthy("m2");
        assert_eq!(manager.get_fallback_model("m1", &candidates), Some("m3".to_string()));

        manager.mark_unhealthy("m3");
        assert_eq!(manager.get_fallback_model("m1", &candidates), None);
        assert_eq!(manager.get_fallback_model("m1", &[]), None);
    }

    #[tokio::test]
    async fn test_health_check_heals() {
        let (manager, _) = manager(
            ScriptedBackend::new()
                .fail("m1", BackendError::transient("down"))
                .reply("m1", "Hello!"),
        );
        manager.mark_unhealthy("m1");

        assert!(!manager.check_model_health("m1").await);
        assert!(!manager.is_healthy("m1"));
        assert!(manager.check_model_health("m1").await);

        let status = manager.status("m1").unwrap();
        assert_eq!(status.state, ModelState::Unknown);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_checked.is_some());
    }

    #[tokio::test]
    async fn test_sequential_preload_keeps_one_resident() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = ModelManager::new(test_config().with_sequential_execution(true), backend.clone());

        assert!(manager.preload_model("a").await);
        assert!(manager.preload_model("b").await);

        let report = manager.status_report().await;
        assert_eq!(report.resident_models, vec!["b".to_string()]);
        assert_eq!(report.model_statuses["a"].state, ModelState::Unloaded);
        assert_eq!(report.model_statuses["b"].state, ModelState::Loaded);
        assert!(backend
            .calls()
            .iter()
            .any(|call| call.op == BackendOp::Unload && call.model == "a"));
    }

    #[tokio::test]
    async fn test_parallel_residency_when_not_sequential() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager =
            ModelManager::new(test_config().with_sequential_execution(false), backend.clone());

        assert!(manager.preload_model("a").await);
        assert!(manager.preload_model("b").await);
        assert_eq!(manager.status_report().await.resident_models.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_preloads_respect_residency() {
        let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(10)));
        let manager = Arc::new(ModelManager::new(test_config(), backend.clone()));

        let mut handles = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.preload_model(name).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let report = manager.status_report().await;
        assert_eq!(report.resident_models.len(), 1);
        let loaded = report
            .model_statuses
            .values()
            .filter(|status| matches!(status.state, ModelState::Loaded | ModelState::Loading))
            .count();
        assert_eq!(loaded, 1);
        assert_eq!(backend.max_in_flight_loads(), 1);
    }

    #[tokio::test]
    async fn test_unload_always_marks_unloaded() {
        let backend = Arc::new(ScriptedBackend::new().fail_unload("a"));
        let manager = ModelManager::new(test_config(), backend);
        assert!(manager.preload_model("a").await);

        assert!(!manager.unload_model("a").await);
        assert_eq!(manager.status("a").unwrap().state, ModelState::Unloaded);
        assert!(manager.status_report().await.resident_models.is_empty());
    }

    #[tokio::test]
    async fn test_preload_failure_surfaces_kind() {
        let backend = Arc::new(ScriptedBackend::new().fail_load("ghost", BackendError::not_found("HTTP 404")));
        let manager = ModelManager::new(test_config().with_preload_models(true), backend.clone());

        let err = manager
            .generate_with_model("ghost", "hi", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NotFound);
        assert_eq!(backend.generation_calls("ghost"), 0);
    }

    #[tokio::test]
    async fn test_available_models_filters_non_generators() {
        let (manager, _) = manager(ScriptedBackend::new().with_models([
            "llama3",
            "nomic-embed-text",
            "whisper-large",
            "mistral",
        ]));
        assert_eq!(
            manager.get_available_models().await.unwrap(),
            vec!["llama3".to_string(), "mistral".to_string()]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (manager, backend) = manager(ScriptedBackend::new());
        manager.close().await;
        manager.close().await;
        assert_eq!(backend.close_count(), 1);
        assert!(manager.is_closed());

        let err = manager
            .generate_with_model("m1", "hi", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Fatal);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(200)));
        let config = test_config().with_request_timeout(Duration::from_millis(20));
        let manager = ModelManager::new(config, backend.clone());

        let err = manager
            .generate_with_model("slow", "hi", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn test_chat_with_mock_backend() {
        let mut backend = MockInferenceBackend::new();
        backend
            .expect_chat()
            .withf(|request| {
                request.model == "m1"
                    && request.messages.len() == 2
                    && request.format == Some(json!({"type": "object"}))
            })
            .times(1)
            .returning(|_| Ok(BackendReply::text("{\"answer\": 4}")));

        let manager = ModelManager::new(test_config(), Arc::new(backend));
        let response = manager
            .generate_with_chat(
                "m1",
                &[ChatMessage::system("be terse"), ChatMessage::user("2+2")],
                &json!({}),
                Some(&json!({"type": "object"})),
            )
            .await
            .unwrap();
        assert_eq!(response.text, "{\"answer\": 4}");
    }

    #[tokio::test]
    async fn test_simulation_mode_backend() {
        let mut config = test_config().with_simulation_mode(true);
        config.cache.enabled = false;
        let manager = ModelManager::from_config(config).unwrap();
        assert_eq!(manager.get_available_models().await.unwrap().len(), 4);
        let response = manager
            .generate_with_model("llama3", "What is 2+2?", &json!({}))
            .await
            .unwrap();
        assert!(response.text.starts_with("Simulated response from llama3"));
    }
}
