//! End-to-end pipeline runs against recording steps and a scripted backend.

#[cfg(test)]
mod tests {
    use crate::config::PipelineConfig;
    use crate::errors::FailureKind;
    use crate::events::CollectingEventSink;
    use crate::models::ModelManager;
    use crate::pipeline::{PipelineBuilder, RunStatus, STEP_FAILED_MARKER};
    use crate::steps::{ModelStep, Step, StepKind, StepSpec, StepStatus};
    use crate::testing::{test_config, BackendOp, Outcome, RecordingStep, ScriptedBackend};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn slow(name: &str) -> Arc<RecordingStep> {
        Arc::new(RecordingStep::new(name).with_delay(Duration::from_millis(30)))
    }

    fn overlaps(a: &RecordingStep, b: &RecordingStep) -> bool {
        let (a_start, a_end) = a.span().unwrap();
        let (b_start, b_end) = b.span().unwrap();
        a_start < b_end && b_start < a_end
    }

    #[tokio::test]
    async fn test_join_waits_for_both_branches() {
        let (a, b, c) = (slow("a"), slow("b"), slow("c"));
        let pipeline = PipelineBuilder::new("join")
            .step("a", a.clone() as Arc<dyn Step>, &[])
            .step("b", b.clone() as Arc<dyn Step>, &[])
            .step("c", c.clone() as Arc<dyn Step>, &["a", "b"])
            .build()
            .unwrap();

        let run = pipeline.run(json!({"query": "x"})).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        let (c_start, _) = c.span().unwrap();
        assert!(c_start >= a.span().unwrap().1);
        assert!(c_start >= b.span().unwrap().1);
        assert!(overlaps(&a, &b), "independent steps should run concurrently");
    }

    #[tokio::test]
    async fn test_sequential_steps_never_overlap() {
        let (a, b, c) = (slow("a"), slow("b"), slow("c"));
        let pipeline = PipelineBuilder::new("sequential")
            .with_config(PipelineConfig {
                sequential_steps: true,
                ..PipelineConfig::default()
            })
            .step("a", a.clone() as Arc<dyn Step>, &[])
            .step("b", b.clone() as Arc<dyn Step>, &[])
            .step("c", c.clone() as Arc<dyn Step>, &[])
            .build()
            .unwrap();

        pipeline.run(json!({})).await.unwrap();

        assert!(!overlaps(&a, &b));
        assert!(!overlaps(&b, &c));
        assert!(a.span().unwrap().1 <= b.span().unwrap().0);
        assert!(b.span().unwrap().1 <= c.span().unwrap().0);
    }

    #[tokio::test]
    async fn test_failure_skips_transitive_dependents() {
        let a = Arc::new(RecordingStep::failing("a"));
        let b = Arc::new(RecordingStep::new("b"));
        let c = Arc::new(RecordingStep::new("c"));
        let d = Arc::new(RecordingStep::new("d"));
        let sink = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new("partial")
            .with_event_sink(sink.clone())
            .step("a", a.clone() as Arc<dyn Step>, &[])
            .step("b", b.clone() as Arc<dyn Step>, &[])
            .step("c", c.clone() as Arc<dyn Step>, &["a"])
            .step("d", d.clone() as Arc<dyn Step>, &["c", "b"])
            .build()
            .unwrap();

        let run = pipeline.run(json!({})).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.result("a").unwrap().status, StepStatus::Failed);
        assert_eq!(run.result("b").unwrap().status, StepStatus::Success);
        assert_eq!(run.result("c").unwrap().status, StepStatus::Skipped);
        assert_eq!(run.result("d").unwrap().status, StepStatus::Skipped);
        assert_eq!(
            run.result("c").unwrap().error.as_ref().unwrap().kind,
            FailureKind::Upstream
        );
        assert_eq!(c.call_count(), 0);
        assert_eq!(d.call_count(), 0);
        assert_eq!(run.success_rate(), "1/4");

        assert_eq!(sink.for_step("step.failed", "a").len(), 1);
        assert_eq!(sink.for_step("step.skipped", "c").len(), 1);
        assert_eq!(sink.for_step("step.skipped", "d").len(), 1);
        assert!(sink.for_step("step.started", "c").is_empty());
        let types = sink.types();
        assert_eq!(types.first().map(String::as_str), Some("pipeline.started"));
        assert_eq!(types.last().map(String::as_str), Some("pipeline.completed"));
    }

    #[tokio::test]
    async fn test_continue_on_failure_passes_placeholder() {
        let c = Arc::new(RecordingStep::new("c"));
        let pipeline = PipelineBuilder::new("tolerant")
            .with_config(PipelineConfig {
                continue_on_failure: true,
                ..PipelineConfig::default()
            })
            .step("a", Arc::new(RecordingStep::failing("a")) as Arc<dyn Step>, &[])
            .step("c", c.clone() as Arc<dyn Step>, &["a"])
            .build()
            .unwrap();

        let run = pipeline.run(json!({"query": "q"})).await.unwrap();

        assert_eq!(run.result("c").unwrap().status, StepStatus::Success);
        assert_eq!(
            c.last_input().unwrap(),
            json!({
                "query": "q",
                "a": {"response": "Step a failed", "error": STEP_FAILED_MARKER},
            })
        );
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_fallback_dependency_policy() {
        let build = |satisfies: bool, c: Arc<RecordingStep>| {
            PipelineBuilder::new("fallback")
                .with_config(PipelineConfig {
                    fallback_satisfies_dependencies: satisfies,
                    ..PipelineConfig::default()
                })
                .step(
                    "a",
                    Arc::new(RecordingStep::with_outcome(
                        "a",
                        Outcome::Fallback(json!({"response": "from backup"})),
                    )) as Arc<dyn Step>,
                    &[],
                )
                .step("c", c as Arc<dyn Step>, &["a"])
                .build()
                .unwrap()
        };

        let c = Arc::new(RecordingStep::new("c"));
        let run = build(true, c.clone()).run(json!({})).await.unwrap();
        assert_eq!(run.result("c").unwrap().status, StepStatus::Success);
        assert_eq!(c.last_input().unwrap()["a"], json!({"response": "from backup"}));

        let c = Arc::new(RecordingStep::new("c"));
        let run = build(false, c.clone()).run(json!({})).await.unwrap();
        assert_eq!(run.result("a").unwrap().status, StepStatus::FallbackSuccess);
        assert_eq!(run.result("c").unwrap().status, StepStatus::Skipped);
        assert_eq!(c.call_count(), 0);
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_dependents_see_only_direct_dependencies() {
        let c = Arc::new(RecordingStep::new("c"));
        let pipeline = PipelineBuilder::new("chain")
            .step("a", Arc::new(RecordingStep::new("a")) as Arc<dyn Step>, &[])
            .step("b", Arc::new(RecordingStep::new("b")) as Arc<dyn Step>, &["a"])
            .step("c", c.clone() as Arc<dyn Step>, &["b"])
            .build()
            .unwrap();

        pipeline.run(json!({"topic": "rust"})).await.unwrap();

        assert_eq!(
            c.last_input().unwrap(),
            json!({"topic": "rust", "b": {"response": "b done"}})
        );
    }

    #[tokio::test]
    async fn test_single_model_step_end_to_end() {
        let backend = Arc::new(ScriptedBackend::new().reply("llama3", "The answer is 4."));
        let manager = Arc::new(ModelManager::new(test_config(), backend.clone()));
        let step = ModelStep::new(manager, "llama3", "Answer: {query}").unwrap();
        let pipeline = PipelineBuilder::new("qa")
            .step("answer", step, &[])
            .build()
            .unwrap();

        let run = pipeline.run(json!({"query": "2+2"})).await.unwrap();
        let value = run.to_json();

        assert_eq!(value["status"], json!("SUCCEEDED"));
        assert_eq!(value["results"]["answer"]["status"], json!("SUCCESS"));
        assert_eq!(
            value["results"]["answer"]["output"],
            json!({"response": "The answer is 4."})
        );
        assert_eq!(value["results"]["answer"]["model"], json!("llama3"));
        assert_eq!(value["results"]["answer"]["fallback"], json!(false));
        assert_eq!(backend.calls()[0].prompt.as_deref(), Some("Answer: 2+2"));
    }

    #[tokio::test]
    async fn test_structured_output_is_parsed_not_raw() {
        let backend = Arc::new(
            ScriptedBackend::new().reply("llama3", "Sure! Here you go: {\"answer\": 4,}"),
        );
        let manager = Arc::new(ModelManager::new(test_config(), backend));
        let step = ModelStep::new(manager, "llama3", "Answer: {query}")
            .unwrap()
            .with_json_output(true);
        let pipeline = PipelineBuilder::new("qa").step("answer", step, &[]).build().unwrap();

        let run = pipeline.run(json!({"query": "2+2"})).await.unwrap();
        assert_eq!(run.output("answer"), Some(&json!({"answer": 4})));
    }

    #[tokio::test]
    async fn test_integration_step_renders_both_upstream_outputs() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .reply("econ", "growth is strong")
                .reply("soc", "people are calm")
                .reply("lead", "balanced outlook"),
        );
        let manager = Arc::new(ModelManager::new(test_config(), backend.clone()));
        let economic = ModelStep::new(manager.clone(), "econ", "Economic view of {query}").unwrap();
        let social = ModelStep::new(manager.clone(), "soc", "Social view of {query}").unwrap();
        let integration = ModelStep::new(
            manager,
            "lead",
            "Combine {economic.response} with {social.response}",
        )
        .unwrap();

        let pipeline = PipelineBuilder::new("analysis")
            .step("economic", economic, &[])
            .step("social", social, &[])
            .step("integration", integration, &["economic", "social"])
            .build()
            .unwrap();

        let run = pipeline.run(json!({"query": "the city"})).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(
            run.result("integration").unwrap().prompt.as_deref(),
            Some("Combine growth is strong with people are calm")
        );
        let lead_call = backend
            .calls()
            .into_iter()
            .find(|call| call.op == BackendOp::Generate && call.model == "lead")
            .unwrap();
        assert_eq!(
            lead_call.prompt.as_deref(),
            Some("Combine growth is strong with people are calm")
        );
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_inside_pipeline() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .always_fail("primary", crate::models::BackendError::not_found("HTTP 404"))
                .reply("backup", "backup answer"),
        );
        let manager = Arc::new(ModelManager::new(test_config(), backend));
        let step = ModelStep::new(manager, "primary", "Q: {query}")
            .unwrap()
            .with_fallback_models(["backup"]);
        let pipeline = PipelineBuilder::new("qa").step("answer", step, &[]).build().unwrap();

        let run = pipeline.run(json!({"query": "x"})).await.unwrap();
        let result = run.result("answer").unwrap();
        assert_eq!(result.status, StepStatus::FallbackSuccess);
        assert_eq!(result.model.as_deref(), Some("backup"));
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_any_step_runs() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = Arc::new(ModelManager::new(test_config(), backend.clone()));
        let step = ModelStep::new(manager, "llama3", "Answer: {question}").unwrap();
        let recorder = Arc::new(RecordingStep::new("first"));
        let pipeline = PipelineBuilder::new("qa")
            .step("first", recorder.clone() as Arc<dyn Step>, &[])
            .step("answer", step, &[])
            .build()
            .unwrap();

        let err = pipeline.run(json!({"query": "2+2"})).await.unwrap_err();

        assert_eq!(err.code(), Some("PIPELINE-TEMPLATE"));
        assert_eq!(err.steps, vec!["answer".to_string()]);
        assert!(backend.calls().is_empty());
        assert_eq!(recorder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_non_object_input_rejected() {
        let pipeline = PipelineBuilder::new("qa")
            .step("a", Arc::new(RecordingStep::new("a")) as Arc<dyn Step>, &[])
            .build()
            .unwrap();

        assert_eq!(
            pipeline.run(json!(["not", "a", "mapping"])).await.unwrap_err().code(),
            Some("PIPELINE-INPUT")
        );
        assert!(pipeline.run(serde_json::Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_configured_steps_from_mappings() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .reply("llama3", "{\"topic\": \"rust\"}")
                .reply("mistral", "Rust is a systems language."),
        );
        let manager = Arc::new(ModelManager::new(test_config(), backend.clone()));
        let outline = StepSpec::from_value(
            "outline",
            json!({"model": "llama3", "prompt_template": "Outline {query}", "json_output": true}),
        )
        .unwrap();
        let writer = StepSpec::from_value(
            "writer",
            json!({"kind": "chat", "model": "mistral", "user_template": "Write about {outline.topic}"}),
        )
        .unwrap();

        let pipeline = PipelineBuilder::new("article")
            .with_manager(manager)
            .step("outline", outline, &[])
            .step("writer", writer, &["outline"])
            .build()
            .unwrap();

        let run = pipeline.run(json!({"query": "rust"})).await.unwrap();

        assert_eq!(run.output("outline"), Some(&json!({"topic": "rust"})));
        assert_eq!(
            run.output("writer"),
            Some(&json!({"response": "Rust is a systems language."}))
        );
        let chat = backend
            .calls()
            .into_iter()
            .find(|call| call.op == BackendOp::Chat)
            .unwrap();
        assert_eq!(chat.messages.last().unwrap().content, "Write about rust");
    }

    #[test]
    fn test_visualize() {
        let manager = Arc::new(ModelManager::new(test_config(), Arc::new(ScriptedBackend::new())));
        let step = ModelStep::new(manager, "llama3", "Q: {query}").unwrap();
        let pipeline = PipelineBuilder::new("viz")
            .step("a", step, &[])
            .step("b", Arc::new(RecordingStep::new("b")) as Arc<dyn Step>, &["a"])
            .build()
            .unwrap();

        let graph = pipeline.visualize();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[0].kind, StepKind::Model);
        assert_eq!(graph.nodes[0].model.as_deref(), Some("llama3"));
        assert_eq!(graph.nodes[1].kind, StepKind::Custom);
        assert_eq!(
            graph.to_json()["edges"],
            json!([{"from": "a", "to": "b"}])
        );
    }
}
