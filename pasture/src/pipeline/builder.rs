//! Pipeline builder with validation.

use std::collections::HashMap;
use std::sync::Arc;

use super::graph::DependencyGraph;
use super::Pipeline;
use crate::config::PipelineConfig;
use crate::errors::PipelineValidationError;
use crate::events::{EventSink, LoggingEventSink};
use crate::models::ModelManager;
use crate::steps::{Step, StepSpec};

/// Collects step declarations and validates them into a [`Pipeline`].
///
/// Dependencies may name steps declared later; the graph is checked as a
/// whole in [`PipelineBuilder::build`].
pub struct PipelineBuilder {
    name: String,
    steps: Vec<(String, StepSpec, Vec<String>)>,
    manager: Option<Arc<ModelManager>>,
    config: Option<PipelineConfig>,
    sink: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    /// Creates a builder for a pipeline called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            manager: None,
            config: None,
            sink: None,
        }
    }

    /// Sets the manager used to resolve steps declared as mappings.
    ///
    /// Its configuration also supplies the pipeline settings unless
    /// [`PipelineBuilder::with_config`] overrides them.
    #[must_use]
    pub fn with_manager(mut self, manager: Arc<ModelManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Sets the scheduling policy.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the lifecycle event sink. Defaults to [`LoggingEventSink`].
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Declares a step and the steps it depends on.
    #[must_use]
    pub fn step(mut self, name: impl Into<String>, step: impl Into<StepSpec>, dependencies: &[&str]) -> Self {
        self.add_step(
            name,
            step,
            dependencies.iter().map(|dep| (*dep).to_string()).collect(),
        );
        self
    }

    /// Declares a step in place.
    pub fn add_step(&mut self, name: impl Into<String>, step: impl Into<StepSpec>, dependencies: Vec<String>) {
        self.steps.push((name.into(), step.into(), dependencies));
    }

    /// Declares several `(name, step, dependencies)` triples.
    #[must_use]
    pub fn steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = (String, S, Vec<String>)>,
        S: Into<StepSpec>,
    {
        for (name, step, dependencies) in steps {
            self.add_step(name, step, dependencies);
        }
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of declared steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no steps are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Validates the graph and resolves every step.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty pipeline, duplicate names,
    /// unknown dependencies, cycles, or steps that cannot be resolved.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        let mut graph = DependencyGraph::new();
        for (name, _, dependencies) in &self.steps {
            graph.add(name.as_str(), dependencies.iter().map(String::as_str))?;
        }
        graph.validate()?;

        let mut steps: HashMap<String, Arc<dyn Step>> = HashMap::with_capacity(self.steps.len());
        for (name, spec, _) in self.steps {
            let step = spec.resolve(&name, self.manager.as_ref())?;
            steps.insert(name, step);
        }

        let config = self
            .config
            .or_else(|| self.manager.as_ref().map(|manager| manager.config().pipeline.clone()))
            .unwrap_or_default();
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(LoggingEventSink::default()));

        Ok(Pipeline::new(self.name, steps, graph, config, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepConfig;
    use crate::testing::{test_config, RecordingStep, ScriptedBackend};
    use pretty_assertions::assert_eq;

    fn recording(name: &str) -> Arc<dyn Step> {
        Arc::new(RecordingStep::new(name))
    }

    #[test]
    fn test_forward_references_allowed() {
        let pipeline = PipelineBuilder::new("demo")
            .step("c", recording("c"), &["a", "b"])
            .step("a", recording("a"), &[])
            .step("b", recording("b"), &[])
            .build()
            .unwrap();
        assert_eq!(pipeline.execution_order(), ["a", "b", "c"]);
        assert_eq!(pipeline.step_names(), ["c", "a", "b"]);
    }

    #[test]
    fn test_cycle_rejected_at_build() {
        let err = PipelineBuilder::new("demo")
            .step("a", recording("a"), &["b"])
            .step("b", recording("b"), &["a"])
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-CYCLE"));
    }

    #[test]
    fn test_empty_and_missing_dependency() {
        assert_eq!(
            PipelineBuilder::new("empty").build().unwrap_err().code(),
            Some("PIPELINE-EMPTY")
        );
        let err = PipelineBuilder::new("demo")
            .step("a", recording("a"), &["ghost"])
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-MISSING-DEP"));
    }

    #[test]
    fn test_config_steps_need_manager() {
        let config = StepConfig {
            model: "llama3".to_string(),
            prompt_template: Some("Answer: {query}".to_string()),
            ..StepConfig::default()
        };

        let err = PipelineBuilder::new("demo")
            .step("answer", config.clone(), &[])
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-STEP-CONFIG"));

        let mut settings = test_config();
        settings.pipeline.sequential_steps = true;
        let manager = Arc::new(ModelManager::new(settings, Arc::new(ScriptedBackend::new())));
        let pipeline = PipelineBuilder::new("demo")
            .with_manager(manager)
            .step("answer", config, &[])
            .build()
            .unwrap();
        assert!(pipeline.config().sequential_steps);
    }
}
