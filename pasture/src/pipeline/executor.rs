//! DAG execution.
//!
//! Steps run as soon as every dependency has reached a terminal state.
//! A dependency that did not succeed either skips its dependents or, with
//! `continue_on_failure`, hands them a placeholder in place of its output.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::graph::DependencyGraph;
use super::run::PipelineRun;
use super::view::{GraphEdge, GraphNode, PipelineGraph};
use super::PipelineBuilder;
use crate::config::PipelineConfig;
use crate::errors::{ErrorInfo, FailureKind, PipelineValidationError};
use crate::events::{
    EventSink, PIPELINE_COMPLETED, PIPELINE_STARTED, STEP_COMPLETED, STEP_FAILED, STEP_SKIPPED,
    STEP_STARTED,
};
use crate::steps::{Step, StepError, StepResult, StepStatus};
use crate::utils::generate_run_id;

/// Error marker placed in the output handed to dependents of a failed step.
pub const STEP_FAILED_MARKER: &str = "step_failed";

/// A validated, runnable graph of steps.
pub struct Pipeline {
    name: String,
    steps: HashMap<String, Arc<dyn Step>>,
    graph: DependencyGraph,
    execution_order: Vec<String>,
    position: HashMap<String, usize>,
    config: PipelineConfig,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("execution_order", &self.execution_order)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub(crate) fn new(
        name: String,
        steps: HashMap<String, Arc<dyn Step>>,
        graph: DependencyGraph,
        config: PipelineConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let execution_order = graph.topological_order();
        let position = execution_order
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect();
        Self {
            name,
            steps,
            graph,
            execution_order,
            position,
            config,
            sink,
        }
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.execution_order.len()
    }

    /// Always false; empty pipelines cannot be built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.execution_order.is_empty()
    }

    /// Step names in declaration order.
    #[must_use]
    pub fn step_names(&self) -> &[String] {
        self.graph.names()
    }

    /// Step names in topological order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Direct dependencies of `step`.
    #[must_use]
    pub fn dependencies(&self, step: &str) -> &[String] {
        self.graph.dependencies(step)
    }

    /// Returns the step called `name`.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Arc<dyn Step>> {
        self.steps.get(name)
    }

    /// Returns the scheduling policy.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Nodes and edges for rendering the graph.
    #[must_use]
    pub fn visualize(&self) -> PipelineGraph {
        let nodes = self
            .graph
            .names()
            .iter()
            .map(|name| {
                let step = self.steps.get(name);
                GraphNode {
                    id: name.clone(),
                    label: name.clone(),
                    kind: step.map(|step| step.kind()).unwrap_or_default(),
                    model: step.and_then(|step| step.model_name()).map(ToString::to_string),
                }
            })
            .collect();
        let edges = self
            .graph
            .names()
            .iter()
            .flat_map(|name| {
                self.graph.dependencies(name).iter().map(move |dep| GraphEdge {
                    from: dep.clone(),
                    to: name.clone(),
                })
            })
            .collect();
        PipelineGraph { nodes, edges }
    }

    /// Runs every step and returns their results.
    ///
    /// Model failures never abort the run; they show up as `FAILED` or
    /// `SKIPPED` step results.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, before any step runs, if `input` is not
    /// a JSON object or a step needs an input that neither `input` nor one of
    /// its dependencies provides.
    pub async fn run(&self, input: Value) -> Result<PipelineRun, PipelineValidationError> {
        let input = self.normalize_input(input)?;
        self.graph.validate()?;
        self.check_required_inputs(&input)?;

        let run_id = generate_run_id();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(pipeline = %self.name, run_id = %run_id, steps = self.len(), "Pipeline started");
        self.sink
            .emit(
                PIPELINE_STARTED,
                Some(json!({
                    "pipeline": self.name,
                    "run_id": run_id.to_string(),
                    "steps": self.execution_order,
                })),
            )
            .await;

        let mut results: BTreeMap<String, StepResult> = BTreeMap::new();
        let mut waiting: HashMap<&str, usize> = self
            .execution_order
            .iter()
            .map(|name| (name.as_str(), self.graph.dependencies(name).len()))
            .collect();
        let mut ready: VecDeque<&str> = self
            .execution_order
            .iter()
            .filter(|name| self.graph.dependencies(name).is_empty())
            .map(String::as_str)
            .collect();
        let limit = if self.config.sequential_steps { 1 } else { usize::MAX };
        let mut active = FuturesUnordered::new();

        loop {
            while active.len() < limit {
                let Some(name) = ready.pop_front() else { break };
                let Some(step) = self.steps.get(name) else { continue };
                let data = self.step_input(name, &input, &results);
                debug!(pipeline = %self.name, step = name, "Step started");
                self.sink
                    .emit(
                        STEP_STARTED,
                        Some(json!({ "step": name, "dependencies": self.graph.dependencies(name) })),
                    )
                    .await;
                active.push(launch(name.to_string(), step.clone(), data));
            }

            let Some((name, result)) = active.next().await else {
                break;
            };
            self.settle(name, result, &mut results, &mut waiting, &mut ready)
                .await;
        }

        for name in &self.execution_order {
            if !results.contains_key(name) {
                warn!(pipeline = %self.name, step = %name, "Step never became ready");
                results.insert(name.clone(), StepResult::skipped("Step never became ready"));
            }
        }

        let status = PipelineRun::status_of(results.values());
        let run = PipelineRun {
            run_id,
            pipeline: self.name.clone(),
            input,
            results,
            status,
            total_time: started.elapsed(),
            started_at,
        };

        info!(
            pipeline = %self.name,
            run_id = %run_id,
            status = %run.status,
            success_rate = %run.success_rate(),
            elapsed_ms = run.total_time.as_millis(),
            "Pipeline completed"
        );
        self.sink
            .emit(
                PIPELINE_COMPLETED,
                Some(json!({
                    "pipeline": self.name,
                    "run_id": run_id.to_string(),
                    "status": run.status,
                    "success_rate": run.success_rate(),
                    "total_time": run.total_time.as_secs_f64(),
                })),
            )
            .await;
        Ok(run)
    }

    fn normalize_input(&self, input: Value) -> Result<Value, PipelineValidationError> {
        match input {
            Value::Null => Ok(Value::Object(Map::new())),
            Value::Object(_) => Ok(input),
            other => Err(PipelineValidationError::new(format!(
                "Pipeline '{}' input must be a JSON object",
                self.name
            ))
            .with_error_info(
                ErrorInfo::new("PIPELINE-INPUT", format!("Got a {} value", json_type(&other)))
                    .with_fix_hint("Pass a mapping such as {\"query\": \"...\"}."),
            )),
        }
    }

    fn check_required_inputs(&self, input: &Value) -> Result<(), PipelineValidationError> {
        for name in &self.execution_order {
            let Some(step) = self.steps.get(name) else { continue };
            let dependencies = self.graph.dependencies(name);
            for required in step.required_inputs() {
                let provided = input.get(&required).is_some() || dependencies.contains(&required);
                if !provided {
                    return Err(PipelineValidationError::new(format!(
                        "Step '{name}' needs '{required}', which is neither in the input nor a dependency"
                    ))
                    .with_steps(vec![name.clone()])
                    .with_error_info(
                        ErrorInfo::new("PIPELINE-TEMPLATE", format!("Unknown placeholder '{{{required}}}'"))
                            .with_fix_hint("Add the value to the run input or declare the step that produces it as a dependency.")
                            .with_context_entry("step", name.clone())
                            .with_context_entry("placeholder", required),
                    ));
                }
            }
        }
        Ok(())
    }

    fn satisfies(&self, result: &StepResult) -> bool {
        match result.status {
            StepStatus::Success => true,
            StepStatus::FallbackSuccess => self.config.fallback_satisfies_dependencies,
            StepStatus::Failed | StepStatus::Skipped => false,
        }
    }

    /// The run input plus each direct dependency's output under its name.
    fn step_input(&self, name: &str, input: &Value, results: &BTreeMap<String, StepResult>) -> Value {
        let mut data = input.as_object().cloned().unwrap_or_default();
        for dep in self.graph.dependencies(name) {
            let upstream = match results.get(dep) {
                Some(result) if result.is_success() => result.output.clone(),
                _ => json!({
                    "response": format!("Step {dep} failed"),
                    "error": STEP_FAILED_MARKER,
                }),
            };
            data.insert(dep.clone(), upstream);
        }
        Value::Object(data)
    }

    /// Records a result, then readies or skips whatever it unblocks.
    async fn settle<'a>(
        &'a self,
        name: String,
        result: StepResult,
        results: &mut BTreeMap<String, StepResult>,
        waiting: &mut HashMap<&'a str, usize>,
        ready: &mut VecDeque<&'a str>,
    ) {
        let mut finished = VecDeque::from([(name, result)]);

        while let Some((name, result)) = finished.pop_front() {
            self.report(&name, &result).await;
            results.insert(name.clone(), result);

            for child in self.graph.dependents(&name) {
                let Some(count) = waiting.get_mut(child) else { continue };
                *count = count.saturating_sub(1);
                if *count > 0 {
                    continue;
                }

                let blocked: Vec<&str> = self
                    .graph
                    .dependencies(child)
                    .iter()
                    .filter(|dep| !results.get(dep.as_str()).is_some_and(|r| self.satisfies(r)))
                    .map(String::as_str)
                    .collect();

                if blocked.is_empty() || self.config.continue_on_failure {
                    let at = self.position.get(child).copied().unwrap_or(usize::MAX);
                    let index = ready.partition_point(|queued| {
                        self.position.get(*queued).copied().unwrap_or(usize::MAX) < at
                    });
                    ready.insert(index, child);
                } else {
                    let reason = format!("Dependency did not succeed: {}", blocked.join(", "));
                    finished.push_back((child.to_string(), StepResult::skipped(reason)));
                }
            }
        }
    }

    async fn report(&self, name: &str, result: &StepResult) {
        let elapsed = result.elapsed.as_secs_f64();
        match result.status {
            StepStatus::Success | StepStatus::FallbackSuccess => {
                info!(
                    pipeline = %self.name,
                    step = name,
                    status = %result.status,
                    model = result.model.as_deref().unwrap_or("-"),
                    elapsed_s = elapsed,
                    "Step completed"
                );
                self.sink
                    .emit(
                        STEP_COMPLETED,
                        Some(json!({
                            "step": name,
                            "status": result.status,
                            "model": result.model,
                            "fallback": result.fallback,
                            "time": elapsed,
                        })),
                    )
                    .await;
            }
            StepStatus::Failed => {
                let (kind, message) = error_parts(result.error.as_ref());
                warn!(pipeline = %self.name, step = name, kind = %kind, error = %message, "Step failed");
                self.sink
                    .emit(
                        STEP_FAILED,
                        Some(json!({
                            "step": name,
                            "kind": kind,
                            "error": message,
                            "model": result.model,
                            "time": elapsed,
                        })),
                    )
                    .await;
            }
            StepStatus::Skipped => {
                let (_, reason) = error_parts(result.error.as_ref());
                info!(pipeline = %self.name, step = name, reason = %reason, "Step skipped");
                self.sink
                    .emit(STEP_SKIPPED, Some(json!({ "step": name, "reason": reason })))
                    .await;
            }
        }
    }
}

fn error_parts(error: Option<&StepError>) -> (FailureKind, String) {
    error.map_or((FailureKind::Fatal, String::new()), |error| {
        (error.kind, error.message.clone())
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Spawns `step` on the runtime and pairs its result with its name.
fn launch(
    name: String,
    step: Arc<dyn Step>,
    data: Value,
) -> impl Future<Output = (String, StepResult)> {
    let handle = tokio::spawn(async move { step.execute(&data).await });
    async move {
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => StepResult::failed(
                StepError::new(FailureKind::Fatal, format!("Step task aborted: {err}")),
                Duration::ZERO,
                None,
            ),
        };
        (name, result)
    }
}
