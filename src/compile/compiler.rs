//! Graph-to-workflow compilation

use crate::compile::workflow::{
    CompiledInput, CompiledNode, CompiledParam, CompiledWorkflow, VolumeSpec, WORKSPACE_MOUNT,
};
use crate::core::graph::PipelineGraph;
use crate::core::guard::Guard;
use crate::core::step::{ParamBinding, StepDescriptor};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// CPU request ceiling in millicores (256 cores).
const MAX_CPU_MILLIS: u64 = 256_000;

/// Memory request ceiling in MiB (1 TiB).
const MAX_MEMORY_MIB: u64 = 1_048_576;

/// Errors from compiling a validated graph.
///
/// A graph that builds can still fail to compile: compilation enforces the
/// target substrate's limits, which are not the graph's concern.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("step '{step}' is not expressible on the substrate: {reason}")]
    UnsupportedFeature { step: String, reason: String },

    #[error("steps '{a}' and '{b}' both map to node id '{id}'")]
    NodeIdCollision { a: String, b: String, id: String },
}

/// Compile a validated pipeline graph into a self-contained workflow.
///
/// Deterministic: the same graph always yields the same document,
/// byte-for-byte after serialization.
pub fn compile(graph: &PipelineGraph, name: &str) -> Result<CompiledWorkflow, CompileError> {
    // Step name -> node id, checked for collisions up front.
    let mut ids: BTreeMap<&str, String> = BTreeMap::new();
    for step in graph.steps() {
        let id = node_id(&step.name);
        if let Some((other, _)) = ids.iter().find(|(_, existing)| **existing == id) {
            return Err(CompileError::NodeIdCollision {
                a: other.to_string(),
                b: step.name.clone(),
                id,
            });
        }
        ids.insert(step.name.as_str(), id);
    }

    let mut nodes = BTreeMap::new();
    for step in graph.steps() {
        check_substrate_limits(step)?;
        let id = &ids[step.name.as_str()];
        nodes.insert(id.clone(), compile_node(step, id, &ids));
    }

    let mut edges: Vec<(String, String)> = graph
        .edges()
        .map(|(from, to)| (ids[from.as_str()].clone(), ids[to.as_str()].clone()))
        .collect();
    edges.sort();
    edges.dedup();

    let params = graph
        .parameters()
        .iter()
        .map(|p| CompiledParam {
            name: p.name.clone(),
            required: p.required,
            default: p.default.clone(),
        })
        .collect();

    debug!(workflow = name, nodes = nodes.len(), edges = edges.len(), "workflow compiled");

    Ok(CompiledWorkflow {
        name: name.to_string(),
        params,
        volume: VolumeSpec::default(),
        nodes,
        edges,
    })
}

fn compile_node(step: &StepDescriptor, id: &str, ids: &BTreeMap<&str, String>) -> CompiledNode {
    let inputs = step
        .parameters
        .iter()
        .map(|(name, binding)| {
            let input = match binding {
                ParamBinding::Literal(v) => CompiledInput::Literal(v.clone()),
                ParamBinding::FromOutput { step, key } => CompiledInput::FromNode {
                    node: ids[step.as_str()].clone(),
                    key: key.clone(),
                },
                ParamBinding::PipelineParam(p) => CompiledInput::Param(p.clone()),
            };
            (name.clone(), input)
        })
        .collect();

    // Guard sources are step names in the graph; the compiled document
    // speaks only in node ids.
    let guard = step.guard.as_ref().map(|g| Guard {
        source_step: ids[g.source_step.as_str()].clone(),
        output_key: g.output_key.clone(),
        op: g.op,
        threshold: g.threshold.clone(),
    });

    CompiledNode {
        step: step.name.clone(),
        image: step.image.clone(),
        command: step.command.clone(),
        work_dir: format!("{}/{}", WORKSPACE_MOUNT, id),
        inputs,
        outputs: step.outputs.clone(),
        resources: step.resources,
        placement: step.placement.clone(),
        retry: step.retry,
        timeout_secs: step.timeout.map(|t| t.as_secs()),
        guard,
    }
}

fn check_substrate_limits(step: &StepDescriptor) -> Result<(), CompileError> {
    let unsupported = |reason: String| CompileError::UnsupportedFeature {
        step: step.name.clone(),
        reason,
    };

    if step.command.is_empty() {
        return Err(unsupported("empty command".to_string()));
    }
    if step.resources.cpu_millis == 0 || step.resources.cpu_millis > MAX_CPU_MILLIS {
        return Err(unsupported(format!(
            "cpu request {}m outside 1..={}m",
            step.resources.cpu_millis, MAX_CPU_MILLIS
        )));
    }
    if step.resources.memory_mib == 0 || step.resources.memory_mib > MAX_MEMORY_MIB {
        return Err(unsupported(format!(
            "memory request {}Mi outside 1..={}Mi",
            step.resources.memory_mib, MAX_MEMORY_MIB
        )));
    }
    if let Some(timeout) = step.timeout {
        if timeout.is_zero() {
            return Err(unsupported("zero timeout".to_string()));
        }
    }
    for key in step.placement.labels.keys() {
        if !is_label_key(key) {
            return Err(unsupported(format!("invalid placement label key '{}'", key)));
        }
    }
    Ok(())
}

/// Derive a node id from a step name: lowercase, with each run of
/// non-alphanumeric characters collapsed to a single hyphen.
pub fn node_id(step_name: &str) -> String {
    let mut id = String::with_capacity(step_name.len());
    let mut pending_hyphen = false;
    for c in step_name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !id.is_empty() {
                id.push('-');
            }
            pending_hyphen = false;
            id.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    id
}

/// DNS-label shape: lowercase alphanumerics and hyphens, starting and
/// ending alphanumeric, at most 63 characters.
fn is_label_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 63
        && key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !key.starts_with(['-', '.'])
        && !key.ends_with(['-', '.'])
}
