//! Configuration for the orchestration core.
//!
//! A [`Config`] is constructed once and shared read-only by the cache,
//! the model manager, steps and pipelines. Every field has a serde default
//! so partial JSON files deserialize cleanly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::{BackoffStrategy, JitterStrategy, RetryPolicy};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON or has the wrong shape.
    #[error("Invalid config file {path}: {source}")]
    Parse {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A field holds an unusable value.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Valid log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug output.
    Debug,
    /// Informational output.
    #[default]
    Info,
    /// Warnings only.
    Warning,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// Returns the `EnvFilter` directive for this level.
    #[must_use]
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether model responses are cached.
    pub enabled: bool,
    /// Directory holding one record per cached key.
    pub dir: PathBuf,
    /// Default TTL in seconds. `None` or zero never expires.
    pub default_ttl_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./cache"),
            default_ttl_seconds: Some(3600),
        }
    }
}

impl CacheConfig {
    /// Returns the default TTL as a duration.
    #[must_use]
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Transport retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum attempts, including the first one.
    pub max_attempts: usize,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

/// Settings for asking a model to correct malformed structured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonPatchingConfig {
    /// Enable patching for steps that do not override it.
    pub enabled: bool,
    /// Maximum patch round-trips per step.
    pub max_attempts: usize,
    /// Wrap the raw text when patching fails instead of failing the step.
    pub fallback_to_text: bool,
    /// Instruction template; `{schema}` is replaced by the schema description.
    pub patching_prompt: String,
}

impl Default for JsonPatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            fallback_to_text: true,
            patching_prompt: "The previous output was not valid JSON. Please fix it and return only valid JSON that matches the expected schema: {schema}".to_string(),
        }
    }
}

/// Pipeline-level scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run steps one at a time in topological order.
    pub sequential_steps: bool,
    /// Whether a dependency that succeeded via a fallback model unblocks dependents.
    pub fallback_satisfies_dependencies: bool,
    /// Run dependents of failed steps with placeholder upstream data instead of skipping them.
    pub continue_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sequential_steps: false,
            fallback_satisfies_dependencies: true,
            continue_on_failure: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache settings.
    pub cache: CacheConfig,
    /// JSON patching settings.
    pub json_patching: JsonPatchingConfig,
    /// Retry settings for network calls.
    pub retry: RetrySettings,
    /// Pipeline scheduling settings.
    pub pipeline: PipelineConfig,
    /// Answer from a synthetic backend instead of a real host.
    pub simulation_mode: bool,
    /// Per-request timeout in seconds.
    pub request_timeout_seconds: f64,
    /// Load a model before generating with it.
    pub preload_models: bool,
    /// Keep at most one model resident on the host.
    pub sequential_execution: bool,
    /// Consecutive failures tolerated before a model is marked unhealthy.
    pub fallback_threshold: u32,
    /// Responses shorter than this (trimmed, in characters) are quality failures.
    pub min_response_length: usize,
    /// Base URL of the inference host.
    pub api_base: String,
    /// Log level.
    pub log_level: LogLevel,
    /// Force debug logging.
    pub debug_mode: bool,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    /// Log response previews.
    pub verbose_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            json_patching: JsonPatchingConfig::default(),
            retry: RetrySettings::default(),
            pipeline: PipelineConfig::default(),
            simulation_mode: false,
            request_timeout_seconds: 90.0,
            preload_models: true,
            sequential_execution: true,
            fallback_threshold: 2,
            min_response_length: 10,
            api_base: "http://localhost:11434".to_string(),
            log_level: LogLevel::Info,
            debug_mode: false,
            log_json: false,
            verbose_output: false,
        }
    }
}

impl Config {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file, falling back to defaults on any error.
    #[must_use]
    pub fn from_file_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "Using default configuration");
                Self::default()
            }
        }
    }

    /// Checks values that the type system cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.request_timeout_seconds.is_finite() || self.request_timeout_seconds <= 0.0 {
            return Err(ConfigError::invalid(
                "request_timeout_seconds",
                "must be a positive number of seconds",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                format!(
                    "must be >= base_delay_ms ({} < {})",
                    self.retry.max_delay_ms, self.retry.base_delay_ms
                ),
            ));
        }
        let dir = self.cache.dir.to_string_lossy();
        if dir.trim().is_empty() {
            return Err(ConfigError::invalid("cache.dir", "must not be empty"));
        }
        if let Some(bad) = dir.chars().find(|c| "<>\"|?*".contains(*c)) {
            return Err(ConfigError::invalid(
                "cache.dir",
                format!("contains invalid character '{bad}'"),
            ));
        }
        if self.api_base.trim().is_empty() {
            return Err(ConfigError::invalid("api_base", "must not be empty"));
        }
        Ok(())
    }

    /// Returns the request timeout as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_seconds.max(0.0))
    }

    /// Builds the transport retry policy described by this configuration.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.retry.max_attempts)
            .with_base_delay_ms(self.retry.base_delay_ms)
            .with_max_delay_ms(self.retry.max_delay_ms)
            .with_backoff(self.retry.backoff)
            .with_jitter(self.retry.jitter)
    }

    /// Sets the cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.dir = dir.into();
        self
    }

    /// Enables or disables simulation mode.
    #[must_use]
    pub fn with_simulation_mode(mut self, enabled: bool) -> Self {
        self.simulation_mode = enabled;
        self
    }

    /// Sets the retry settings.
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables model preloading.
    #[must_use]
    pub fn with_preload_models(mut self, enabled: bool) -> Self {
        self.preload_models = enabled;
        self
    }

    /// Enables or disables single-model residency.
    #[must_use]
    pub fn with_sequential_execution(mut self, enabled: bool) -> Self {
        self.sequential_execution = enabled;
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_fallback_threshold(mut self, threshold: u32) -> Self {
        self.fallback_threshold = threshold;
        self
    }

    /// Sets the minimum response length.
    #[must_use]
    pub fn with_min_response_length(mut self, length: usize) -> Self {
        self.min_response_length = length;
        self
    }

    /// Sets the JSON patching settings.
    #[must_use]
    pub fn with_json_patching(mut self, patching: JsonPatchingConfig) -> Self {
        self.json_patching = patching;
        self
    }

    /// Sets the pipeline settings.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_seconds = timeout.as_secs_f64();
        self
    }
}
