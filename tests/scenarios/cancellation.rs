//! Test: cancellation stops a run and settles every node

use crate::helpers::*;
use conveyor::core::{OutputValue, PipelineManifest};
use conveyor::execution::{NodePhase, RunEngine, RunInstance, RunStatus, Runner};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MANIFEST: &str = r#"
name: long-haul
steps:
  - name: prepare
    image: prep:latest
    command: ["prep"]
    outputs: [ready]
  - name: crunch
    image: cruncher:latest
    command: ["crunch"]
    depends_on: [prepare]
  - name: publish
    image: publisher:latest
    command: ["publish"]
    depends_on: [crunch]
"#;

fn compile_manifest() -> conveyor::CompiledWorkflow {
    let manifest = PipelineManifest::from_yaml(MANIFEST).unwrap();
    let name = manifest.name.clone();
    conveyor::compile(&manifest.into_graph().unwrap(), &name).unwrap()
}

#[tokio::test]
async fn test_cancel_mid_run_settles_all_nodes() {
    let workflow = compile_manifest();
    let substrate = MockSubstrate::new()
        .script(
            "prepare",
            vec![succeed_with(&[("ready", OutputValue::Bool(true))])],
        )
        .script("crunch", vec![MockOutcome::Hang]);

    let engine = RunEngine::new(substrate);
    let cancel = Arc::new(AtomicBool::new(false));

    let flag = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        flag.store(true, Ordering::SeqCst);
    });

    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine
        .execute_interruptible(&workflow, &mut run, cancel.clone())
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Cancelled);
    assert!(run.all_terminal(), "every node must settle on cancellation");
    assert_succeeded(&run, "prepare");
    assert_eq!(run.node("crunch").unwrap().phase, NodePhase::Cancelled);
    assert_eq!(run.node("publish").unwrap().phase, NodePhase::Cancelled);

    // Raising the flag again after completion changes nothing.
    cancel.store(true, Ordering::SeqCst);
    assert_eq!(run.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_runner_cancel_is_idempotent() {
    let workflow = compile_manifest();
    let substrate = MockSubstrate::new()
        .script(
            "prepare",
            vec![succeed_with(&[("ready", OutputValue::Bool(true))])],
        )
        .script("crunch", vec![MockOutcome::Hang]);

    let runner = Runner::new(RunEngine::new(substrate));
    let run_id = runner.start(workflow, BTreeMap::new());

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Mid-run snapshot reflects progress without blocking the run.
    let mid = runner.snapshot(run_id).unwrap();
    assert!(matches!(
        mid.node("prepare").unwrap().phase,
        NodePhase::Succeeded { .. }
    ));

    assert!(runner.cancel(run_id));
    assert!(runner.cancel(run_id));

    let run = runner.wait(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.all_terminal());
    assert_eq!(runner.status(run_id), Some(RunStatus::Cancelled));

    let snapshot = runner.snapshot(run_id).unwrap();
    assert!(snapshot.all_terminal());
    assert_eq!(snapshot.node("crunch").unwrap().phase, NodePhase::Cancelled);

    // Cancelling a finished run stays safe.
    assert!(runner.cancel(run_id));
}

#[tokio::test]
async fn test_evict_drops_finished_run_bookkeeping() {
    let workflow = compile_manifest();
    let substrate = MockSubstrate::new().script(
        "prepare",
        vec![succeed_with(&[("ready", OutputValue::Bool(true))])],
    );

    let runner = Runner::new(RunEngine::new(substrate));
    let run_id = runner.start(workflow, BTreeMap::new());

    // A run still in progress cannot be evicted.
    assert!(runner.evict(run_id).is_none());

    let run = runner.wait(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    let evicted = runner.evict(run_id).unwrap();
    assert_eq!(evicted.status, RunStatus::Succeeded);
    assert_eq!(runner.status(run_id), None);
    assert!(runner.snapshot(run_id).is_none());
    assert!(!runner.cancel(run_id));
    assert!(runner.evict(run_id).is_none());
}

#[tokio::test]
async fn test_cancel_unknown_run_is_rejected() {
    let runner = Runner::new(RunEngine::new(MockSubstrate::new()));
    assert!(!runner.cancel(uuid::Uuid::new_v4()));
    assert_eq!(runner.status(uuid::Uuid::new_v4()), None);
}
