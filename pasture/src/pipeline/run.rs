//! The record of one pipeline execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::steps::{StepResult, StepStatus};
use crate::utils::duration_secs;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Every step that ran succeeded.
    Succeeded,
    /// At least one step failed.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Per-step results and the aggregate status of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Name of the pipeline that ran.
    pub pipeline: String,
    /// The input the run started with.
    pub input: Value,
    /// Result of every step, keyed by step name.
    pub results: BTreeMap<String, StepResult>,
    /// Aggregate status.
    pub status: RunStatus,
    /// Wall time of the whole run.
    #[serde(with = "duration_secs")]
    pub total_time: Duration,
    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    /// `SUCCEEDED` iff every non-skipped step succeeded.
    #[must_use]
    pub fn status_of<'a>(results: impl IntoIterator<Item = &'a StepResult>) -> RunStatus {
        let all_ok = results
            .into_iter()
            .filter(|result| result.status != StepStatus::Skipped)
            .all(StepResult::is_success);
        if all_ok {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    /// Returns the result of `step`.
    #[must_use]
    pub fn result(&self, step: &str) -> Option<&StepResult> {
        self.results.get(step)
    }

    /// Returns the output of `step`.
    #[must_use]
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.results.get(step).map(|result| &result.output)
    }

    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Number of steps with `SUCCESS` or `FALLBACK_SUCCESS`.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.results.values().filter(|result| result.is_success()).count()
    }

    /// Number of steps in the run.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    /// `"<successes>/<total>"`.
    #[must_use]
    pub fn success_rate(&self) -> String {
        format!("{}/{}", self.success_count(), self.total_count())
    }

    /// Names of steps with the given status, in name order.
    #[must_use]
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| result.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// The caller-facing shape: `{"results": {step: {...}}, "status": ...}` plus run metadata.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let results: Map<String, Value> = self
            .results
            .iter()
            .map(|(name, result)| (name.clone(), result.to_json()))
            .collect();
        json!({
            "run_id": self.run_id.to_string(),
            "pipeline": self.pipeline,
            "results": results,
            "status": self.status,
            "total_time": self.total_time.as_secs_f64(),
            "started_at": self.started_at.to_rfc3339(),
            "success_count": self.success_count(),
            "total_count": self.total_count(),
            "success_rate": self.success_rate(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepError;
    use pretty_assertions::assert_eq;

    fn run(results: Vec<(&str, StepResult)>) -> PipelineRun {
        let results: BTreeMap<String, StepResult> = results
            .into_iter()
            .map(|(name, result)| (name.to_string(), result))
            .collect();
        PipelineRun {
            run_id: Uuid::new_v4(),
            pipeline: "demo".to_string(),
            input: json!({}),
            status: PipelineRun::status_of(results.values()),
            results,
            total_time: Duration::from_millis(1500),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_skipped_steps_do_not_fail_the_run() {
        let run = run(vec![
            ("a", StepResult::success(json!({"response": "x"}), Duration::ZERO, "m")),
            ("b", StepResult::skipped("upstream")),
        ]);
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.success_rate(), "1/2");
        assert_eq!(run.steps_with_status(StepStatus::Skipped), vec!["b"]);
    }

    #[test]
    fn test_failure_fails_the_run() {
        let run = run(vec![
            ("a", StepResult::failed(StepError::configuration("bad"), Duration::ZERO, None)),
            ("b", StepResult::fallback_success(json!({}), Duration::ZERO, "m2")),
        ]);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!run.is_success());
        assert_eq!(run.success_count(), 1);
    }

    #[test]
    fn test_json_shape() {
        let run = run(vec![(
            "answer",
            StepResult::success(json!({"response": "4"}), Duration::from_millis(500), "llama3"),
        )]);
        let value = run.to_json();
        assert_eq!(value["status"], json!("SUCCEEDED"));
        assert_eq!(value["total_time"], json!(1.5));
        assert_eq!(
            value["results"]["answer"],
            json!({
                "status": "SUCCESS",
                "output": {"response": "4"},
                "time": 0.5,
                "model": "llama3",
                "fallback": false,
            })
        );
        assert_eq!(value["success_rate"], json!("1/1"));
    }
}
