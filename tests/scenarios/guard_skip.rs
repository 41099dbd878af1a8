//! Test: a false guard skips the gated node without failing the run

use crate::helpers::*;
use conveyor::core::{OutputValue, PipelineManifest};
use conveyor::execution::{RunEngine, RunInstance, RunStatus, SkipReason};

const MANIFEST: &str = r#"
name: gated-deploy
steps:
  - name: train
    image: trainer:latest
    command: ["python", "train.py"]
    outputs: [model_path, mse]
  - name: deploy
    image: deployer:latest
    command: ["deploy", "{{ model }}"]
    params:
      model: "{{ steps.train.outputs.model_path }}"
    when: "steps.train.outputs.mse < 12"
    outputs: [endpoint]
  - name: announce
    image: notifier:latest
    command: ["notify", "{{ endpoint }}"]
    params:
      endpoint: "{{ steps.deploy.outputs.endpoint }}"
  - name: archive
    image: archiver:latest
    command: ["archive"]
    depends_on: [deploy]
"#;

fn workflow_with_mse(mse: f64) -> (conveyor::CompiledWorkflow, MockSubstrate) {
    let manifest = PipelineManifest::from_yaml(MANIFEST).unwrap();
    let name = manifest.name.clone();
    let workflow = conveyor::compile(&manifest.into_graph().unwrap(), &name).unwrap();
    let substrate = MockSubstrate::new()
        .script(
            "train",
            vec![succeed_with(&[
                ("model_path", OutputValue::from("/workspace/train/model.bin")),
                ("mse", OutputValue::Float(mse)),
            ])],
        )
        .script(
            "deploy",
            vec![succeed_with(&[(
                "endpoint",
                OutputValue::from("https://models.internal/v3"),
            )])],
        );
    (workflow, substrate)
}

#[tokio::test]
async fn test_bad_model_is_not_deployed() {
    let (workflow, substrate) = workflow_with_mse(15.0);
    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    // Guard-false skips are part of normal operation, not failures.
    assert_eq!(status, RunStatus::Succeeded);
    assert_succeeded(&run, "train");
    assert_skipped(&run, "deploy", SkipReason::GuardFalse);

    // 'announce' binds deploy's outputs and can never resolve them;
    // 'archive' only orders after deploy and still runs.
    assert_skipped(&run, "announce", SkipReason::UpstreamSkipped);
    assert_succeeded(&run, "archive");

    assert!(!run.dispatch_order.contains(&"deploy".to_string()));
    assert!(!run.dispatch_order.contains(&"announce".to_string()));
}

#[tokio::test]
async fn test_guard_exactly_at_threshold_is_false() {
    let (workflow, substrate) = workflow_with_mse(12.0);
    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_skipped(&run, "deploy", SkipReason::GuardFalse);
}

#[tokio::test]
async fn test_passing_guard_runs_whole_chain() {
    let (workflow, substrate) = workflow_with_mse(9.44);
    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_succeeded(&run, "deploy");
    assert_succeeded(&run, "announce");
    assert_succeeded(&run, "archive");
    assert_dispatched_before(&run, "deploy", "announce");
}
