//! Test: retries, exhaustion, and failure propagation

use crate::helpers::*;
use conveyor::core::{OutputValue, PipelineManifest};
use conveyor::execution::{RunEngine, RunInstance, RunStatus, SkipReason};

const MANIFEST: &str = r#"
name: flaky-train
steps:
  - name: train
    image: trainer:latest
    command: ["python", "train.py"]
    max_retries: 3
    backoff_ms: 1
    outputs: [mse]
  - name: evaluate
    image: evaluator:latest
    command: ["evaluate", "{{ mse }}"]
    params:
      mse: "{{ steps.train.outputs.mse }}"
    outputs: [verdict]
  - name: deploy
    image: deployer:latest
    command: ["deploy"]
    depends_on: [evaluate]
"#;

fn compile_manifest() -> conveyor::CompiledWorkflow {
    let manifest = PipelineManifest::from_yaml(MANIFEST).unwrap();
    let name = manifest.name.clone();
    conveyor::compile(&manifest.into_graph().unwrap(), &name).unwrap()
}

#[tokio::test]
async fn test_flaky_node_recovers_within_budget() {
    let workflow = compile_manifest();
    let substrate = MockSubstrate::new()
        .script(
            "train",
            vec![
                MockOutcome::Fail("exited with code 1".to_string()),
                MockOutcome::Fail("exited with code 1".to_string()),
                succeed_with(&[("mse", OutputValue::Float(9.44))]),
            ],
        )
        .script(
            "evaluate",
            vec![succeed_with(&[("verdict", OutputValue::from("ok"))])],
        );

    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_succeeded(&run, "train");
    assert_eq!(run.node("train").unwrap().attempts, 3);
    assert_succeeded(&run, "evaluate");
    assert_succeeded(&run, "deploy");
}

#[tokio::test]
async fn test_exhausted_retries_fail_run_and_skip_downstream() {
    let workflow = compile_manifest();
    // max_retries: 3 allows 4 attempts; script all of them to fail.
    let substrate = MockSubstrate::new().script(
        "train",
        vec![
            MockOutcome::Fail("exited with code 1".to_string()),
            MockOutcome::Fail("exited with code 1".to_string()),
            MockOutcome::Fail("exited with code 1".to_string()),
            MockOutcome::Fail("exited with code 1".to_string()),
        ],
    );

    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    match status {
        RunStatus::Failed { node, error } => {
            assert_eq!(node, "train");
            assert!(error.contains("exited with code 1"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    assert_failed(&run, "train");
    assert_eq!(run.node("train").unwrap().attempts, 4);
    assert_skipped(&run, "evaluate", SkipReason::UpstreamFailed);
    assert_skipped(&run, "deploy", SkipReason::UpstreamFailed);
}

#[tokio::test]
async fn test_no_retry_policy_means_single_attempt() {
    let yaml = r#"
name: no-retries
steps:
  - name: fragile
    image: x:latest
    command: ["run"]
"#;
    let manifest = PipelineManifest::from_yaml(yaml).unwrap();
    let name = manifest.name.clone();
    let workflow = conveyor::compile(&manifest.into_graph().unwrap(), &name).unwrap();

    let substrate =
        MockSubstrate::new().script("fragile", vec![MockOutcome::Fail("boom".to_string())]);
    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    assert!(matches!(status, RunStatus::Failed { .. }));
    assert_eq!(run.node("fragile").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_rejected_submission_retries_like_any_failure() {
    let workflow = compile_manifest();
    // The substrate refuses the first two submissions; the retry policy
    // absorbs them and the third attempt runs normally.
    let substrate = MockSubstrate::new()
        .script(
            "train",
            vec![
                MockOutcome::RejectSubmit("substrate temporarily unavailable".to_string()),
                MockOutcome::RejectSubmit("substrate temporarily unavailable".to_string()),
                succeed_with(&[("mse", OutputValue::Float(9.44))]),
            ],
        )
        .script(
            "evaluate",
            vec![succeed_with(&[("verdict", OutputValue::from("ok"))])],
        );

    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_succeeded(&run, "train");
    assert_eq!(run.node("train").unwrap().attempts, 3);
    assert_succeeded(&run, "evaluate");
    assert_succeeded(&run, "deploy");
}

#[tokio::test]
async fn test_persistent_submit_rejection_fails_node_not_run() {
    let workflow = compile_manifest();
    // Every submission is refused. The node exhausts its budget, the run
    // still settles terminally and names the node, and downstream nodes
    // are skipped as on any other failure.
    let substrate = MockSubstrate::new().script(
        "train",
        vec![
            MockOutcome::RejectSubmit("substrate temporarily unavailable".to_string()),
            MockOutcome::RejectSubmit("substrate temporarily unavailable".to_string()),
            MockOutcome::RejectSubmit("substrate temporarily unavailable".to_string()),
            MockOutcome::RejectSubmit("substrate temporarily unavailable".to_string()),
        ],
    );

    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    match status {
        RunStatus::Failed { node, error } => {
            assert_eq!(node, "train");
            assert!(error.contains("temporarily unavailable"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    assert!(run.all_terminal());
    assert_failed(&run, "train");
    assert_eq!(run.node("train").unwrap().attempts, 4);
    assert_skipped(&run, "evaluate", SkipReason::UpstreamFailed);
    assert_skipped(&run, "deploy", SkipReason::UpstreamFailed);
}

#[tokio::test]
async fn test_missing_declared_output_is_attempt_failure() {
    let workflow = compile_manifest();
    // train succeeds but never publishes mse; that attempt counts as a
    // failure and retries kick in until a good attempt publishes it.
    let substrate = MockSubstrate::new()
        .script(
            "train",
            vec![
                succeed_with(&[]),
                succeed_with(&[("mse", OutputValue::Float(3.2))]),
            ],
        )
        .script(
            "evaluate",
            vec![succeed_with(&[("verdict", OutputValue::from("ok"))])],
        );

    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(run.node("train").unwrap().attempts, 2);
}
