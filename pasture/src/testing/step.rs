//! A step that records how it was called.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::errors::FailureKind;
use crate::steps::{Step, StepError, StepResult};

/// What a [`RecordingStep`] reports.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// `SUCCESS` with the output.
    Succeed(Value),
    /// `FALLBACK_SUCCESS` with the output.
    Fallback(Value),
    /// `FAILED` with the kind and message.
    Fail(FailureKind, String),
}

/// Returns a fixed outcome and records every input it receives.
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    outcome: Outcome,
    delay: Duration,
    required: Vec<String>,
    inputs: Mutex<Vec<Value>>,
    spans: Mutex<Vec<(Instant, Instant)>>,
}

impl RecordingStep {
    /// A step that succeeds with `{"response": "<name> done"}`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let output = json!({ "response": format!("{name} done") });
        Self::with_outcome(name, Outcome::Succeed(output))
    }

    /// A step with an explicit outcome.
    #[must_use]
    pub fn with_outcome(name: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            name: name.into(),
            outcome,
            delay: Duration::ZERO,
            required: Vec::new(),
            inputs: Mutex::new(Vec::new()),
            spans: Mutex::new(Vec::new()),
        }
    }

    /// A step that fails with a fatal error.
    #[must_use]
    pub fn failing(name: impl Into<String>) -> Self {
        let name = name.into();
        let message = format!("{name} broke");
        Self::with_outcome(name, Outcome::Fail(FailureKind::Fatal, message))
    }

    /// Sleeps for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Declares required input names.
    #[must_use]
    pub fn with_required_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = names.into_iter().map(Into::into).collect();
        self
    }

    /// Number of executions.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Every input received, in order.
    #[must_use]
    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().clone()
    }

    /// The most recent input.
    #[must_use]
    pub fn last_input(&self) -> Option<Value> {
        self.inputs.lock().last().cloned()
    }

    /// Start and finish instants of the first execution.
    #[must_use]
    pub fn span(&self) -> Option<(Instant, Instant)> {
        self.spans.lock().first().copied()
    }
}

#[async_trait]
impl Step for RecordingStep {
    async fn execute(&self, data: &Value) -> StepResult {
        let started = Instant::now();
        self.inputs.lock().push(data.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let elapsed = started.elapsed();
        self.spans.lock().push((started, Instant::now()));

        match &self.outcome {
            Outcome::Succeed(output) => StepResult::success(output.clone(), elapsed, &self.name),
            Outcome::Fallback(output) => {
                StepResult::fallback_success(output.clone(), elapsed, format!("{}-backup", self.name))
            }
            Outcome::Fail(kind, message) => {
                StepResult::failed(StepError::new(*kind, message.clone()), elapsed, None)
            }
        }
    }

    fn required_inputs(&self) -> Vec<String> {
        self.required.clone()
    }
}
