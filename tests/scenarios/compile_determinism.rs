//! Test: compilation is deterministic and independent of authoring order

use conveyor::core::{GraphBuilder, StepBuilder};

fn step(name: &str, deps: &[&str]) -> conveyor::StepDescriptor {
    let mut builder = StepBuilder::new(name, "busybox:latest").command(["true"]);
    for dep in deps {
        builder = builder.depends_on(*dep);
    }
    builder.build()
}

#[test]
fn test_insertion_order_does_not_change_output() {
    let forward = {
        let mut b = GraphBuilder::new();
        b.add_step(step("fetch", &[])).unwrap();
        b.add_step(step("clean", &["fetch"])).unwrap();
        b.add_step(step("report", &["clean"])).unwrap();
        conveyor::compile(&b.build().unwrap(), "etl").unwrap()
    };
    let reversed = {
        let mut b = GraphBuilder::new();
        b.add_step(step("report", &["clean"])).unwrap();
        b.add_step(step("clean", &["fetch"])).unwrap();
        b.add_step(step("fetch", &[])).unwrap();
        conveyor::compile(&b.build().unwrap(), "etl").unwrap()
    };

    assert_eq!(
        forward.to_yaml().unwrap(),
        reversed.to_yaml().unwrap(),
        "compiled document must not depend on step insertion order"
    );
}

#[test]
fn test_document_round_trips_exactly() {
    let mut b = GraphBuilder::new();
    b.add_step(
        StepBuilder::new("train", "trainer:latest")
            .command(["python", "train.py", "--lr", "{{ lr }}"])
            .param("lr", 0.01)
            .output("mse")
            .resources(2000, 4096)
            .placement_label("accelerator", "gpu")
            .retries(2)
            .build(),
    )
    .unwrap();
    let workflow = conveyor::compile(&b.build().unwrap(), "train-only").unwrap();

    let yaml = workflow.to_yaml().unwrap();
    let reparsed = conveyor::CompiledWorkflow::from_yaml(&yaml).unwrap();
    assert_eq!(reparsed, workflow);
    assert_eq!(reparsed.to_yaml().unwrap(), yaml);
}

#[test]
fn test_work_dirs_are_namespaced_per_node() {
    let mut b = GraphBuilder::new();
    b.add_step(step("Get Data", &[])).unwrap();
    b.add_step(step("Train Model", &["Get Data"])).unwrap();
    let workflow = conveyor::compile(&b.build().unwrap(), "ml").unwrap();

    assert_eq!(workflow.nodes["get-data"].work_dir, "/workspace/get-data");
    assert_eq!(
        workflow.nodes["train-model"].work_dir,
        "/workspace/train-model"
    );
    assert_eq!(workflow.volume.mount_path, "/workspace");
}
