//! Test: structural errors surface at build time, before anything runs

use conveyor::core::{BuildError, PipelineManifest};

#[test]
fn test_cycle_in_manifest_is_rejected() {
    let yaml = r#"
name: cyclic
steps:
  - name: a
    image: x:latest
    command: ["true"]
    depends_on: [b]
  - name: b
    image: x:latest
    command: ["true"]
    depends_on: [a]
"#;
    let manifest = PipelineManifest::from_yaml(yaml).unwrap();
    let err = manifest.into_graph().unwrap_err();
    let build_err = err.downcast::<BuildError>().unwrap();

    match build_err {
        BuildError::CycleDetected(cycle) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected CycleDetected, got {:?}", other),
    }
}

#[test]
fn test_duplicate_step_names_rejected() {
    let yaml = r#"
name: duplicated
steps:
  - name: build
    image: x:latest
    command: ["true"]
  - name: build
    image: y:latest
    command: ["true"]
"#;
    let manifest = PipelineManifest::from_yaml(yaml).unwrap();
    let err = manifest.into_graph().unwrap_err();
    assert!(matches!(
        err.downcast::<BuildError>().unwrap(),
        BuildError::DuplicateStepName(name) if name == "build"
    ));
}

#[test]
fn test_binding_to_missing_step_rejected() {
    let yaml = r#"
name: dangling
steps:
  - name: consume
    image: x:latest
    command: ["run", "{{ input }}"]
    params:
      input: "{{ steps.produce.outputs.artifact }}"
"#;
    let manifest = PipelineManifest::from_yaml(yaml).unwrap();
    let err = manifest.into_graph().unwrap_err();
    assert!(matches!(
        err.downcast::<BuildError>().unwrap(),
        BuildError::DanglingParameterReference { .. }
    ));
}

#[test]
fn test_binding_to_undeclared_output_rejected() {
    let yaml = r#"
name: dangling-key
steps:
  - name: produce
    image: x:latest
    command: ["run"]
    outputs: [artifact]
  - name: consume
    image: x:latest
    command: ["run", "{{ input }}"]
    params:
      input: "{{ steps.produce.outputs.missing }}"
"#;
    let manifest = PipelineManifest::from_yaml(yaml).unwrap();
    let err = manifest.into_graph().unwrap_err();
    match err.downcast::<BuildError>().unwrap() {
        BuildError::DanglingParameterReference { step, reason, .. } => {
            assert_eq!(step, "consume");
            assert!(reason.contains("missing"));
        }
        other => panic!("expected DanglingParameterReference, got {:?}", other),
    }
}

#[test]
fn test_dependency_on_unknown_step_rejected() {
    let yaml = r#"
name: unknown-dep
steps:
  - name: only
    image: x:latest
    command: ["true"]
    depends_on: [ghost]
"#;
    let manifest = PipelineManifest::from_yaml(yaml).unwrap();
    let err = manifest.into_graph().unwrap_err();
    assert!(matches!(
        err.downcast::<BuildError>().unwrap(),
        BuildError::UnknownStep(name) if name == "ghost"
    ));
}
