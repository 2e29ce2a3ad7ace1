//! Per-model health and residency tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a model as seen by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    /// Referenced but never loaded or probed.
    #[default]
    Unknown,
    /// A load request is in flight.
    Loading,
    /// Resident on the host.
    Loaded,
    /// Released from the host.
    Unloaded,
    /// Too many consecutive failures. Excluded from fallback selection.
    Unhealthy,
}

/// Tracked status of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    /// Model name.
    pub name: String,
    /// Current state.
    pub state: ModelState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Last health probe.
    pub last_checked: Option<DateTime<Utc>>,
    /// Last generation request.
    pub last_used: Option<DateTime<Utc>>,
}

impl ModelStatus {
    /// Creates an `Unknown` status.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ModelState::Unknown,
            consecutive_failures: 0,
            last_checked: None,
            last_used: None,
        }
    }

    /// Returns true unless the model is marked unhealthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state != ModelState::Unhealthy
    }

    /// Records one failure. Returns true if this failure made the model unhealthy.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures > threshold && self.state != ModelState::Unhealthy {
            self.state = ModelState::Unhealthy;
            return true;
        }
        false
    }

    /// Records a success, clearing the failure counter.
    ///
    /// An unhealthy model recovers to `resident_state`.
    pub fn record_success(&mut self, resident_state: ModelState) {
        self.consecutive_failures = 0;
        if self.state == ModelState::Unhealthy {
            self.state = resident_state;
        }
    }
}

/// Serializable snapshot of the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatusReport {
    /// Models currently believed resident on the host.
    pub resident_models: Vec<String>,
    /// Every model referenced so far.
    pub model_statuses: BTreeMap<String, ModelStatus>,
}
