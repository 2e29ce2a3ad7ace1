//! Test doubles for backends and steps.
//!
//! These are compiled into the library so downstream crates can exercise
//! their pipelines without a model host.

mod backend;
mod step;

pub use backend::{BackendCall, BackendOp, ScriptedBackend};
pub use step::{Outcome, RecordingStep};

use crate::config::{Config, RetrySettings};

/// A configuration tuned for tests: no cache, no preloading, millisecond backoff
/// and a one-character quality floor.
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default()
        .with_preload_models(false)
        .with_min_response_length(1)
        .with_retry(RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            ..RetrySettings::default()
        });
    config.cache.enabled = false;
    config
}
