//! Test: linear pipeline with a passing guard deploys

use crate::helpers::*;
use conveyor::core::{OutputValue, PipelineManifest};
use conveyor::execution::{RunEngine, RunInstance, RunStatus};

const MANIFEST: &str = r#"
name: iris-train
steps:
  - name: get-data
    image: curlimages/curl:8
    command: ["sh", "-c", "fetch"]
    outputs: [raw_path]
  - name: train
    image: trainer:latest
    command: ["python", "train.py", "--data", "{{ data }}"]
    params:
      data: "{{ steps.get-data.outputs.raw_path }}"
    outputs: [model_path, mse]
  - name: deploy
    image: deployer:latest
    command: ["deploy", "{{ model }}"]
    params:
      model: "{{ steps.train.outputs.model_path }}"
    when: "steps.train.outputs.mse < 12"
"#;

fn compile_manifest() -> conveyor::CompiledWorkflow {
    let manifest = PipelineManifest::from_yaml(MANIFEST).unwrap();
    let name = manifest.name.clone();
    conveyor::compile(&manifest.into_graph().unwrap(), &name).unwrap()
}

#[tokio::test]
async fn test_good_model_is_deployed() {
    let workflow = compile_manifest();
    let substrate = MockSubstrate::new()
        .script(
            "get-data",
            vec![succeed_with(&[(
                "raw_path",
                OutputValue::from("/workspace/get-data/raw.csv"),
            )])],
        )
        .script(
            "train",
            vec![succeed_with(&[
                ("model_path", OutputValue::from("/workspace/train/model.bin")),
                ("mse", OutputValue::Float(9.44)),
            ])],
        );

    let engine = RunEngine::new(substrate);
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let status = engine.execute(&workflow, &mut run).await.unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_succeeded(&run, "get-data");
    assert_succeeded(&run, "train");
    assert_succeeded(&run, "deploy");

    assert_dispatched_before(&run, "get-data", "train");
    assert_dispatched_before(&run, "train", "deploy");

    // The guard source value is recorded on the node.
    assert_eq!(
        run.node("train").unwrap().outputs["mse"],
        OutputValue::Float(9.44)
    );
}

#[tokio::test]
async fn test_each_node_dispatched_once() {
    let workflow = compile_manifest();
    let engine = RunEngine::new(
        MockSubstrate::new()
            .script(
                "get-data",
                vec![succeed_with(&[("raw_path", OutputValue::from("x"))])],
            )
            .script(
                "train",
                vec![succeed_with(&[
                    ("model_path", OutputValue::from("m")),
                    ("mse", OutputValue::Float(1.0)),
                ])],
            ),
    );
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    engine.execute(&workflow, &mut run).await.unwrap();

    assert_eq!(run.dispatch_order.len(), 3);
    assert_eq!(run.node("train").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_missing_required_param_aborts() {
    let yaml = r#"
name: parameterized
params:
  - name: data_url
    required: true
steps:
  - name: fetch
    image: curlimages/curl:8
    command: ["curl", "{{ url }}"]
    params:
      url: "{{ params.data_url }}"
"#;
    let manifest = PipelineManifest::from_yaml(yaml).unwrap();
    let name = manifest.name.clone();
    let workflow = conveyor::compile(&manifest.into_graph().unwrap(), &name).unwrap();

    let engine = RunEngine::new(MockSubstrate::new());
    let mut run = RunInstance::new(&workflow.name, workflow.nodes.keys().cloned());
    let result = engine.execute(&workflow, &mut run).await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("data_url"));
}
