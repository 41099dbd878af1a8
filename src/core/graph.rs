//! Pipeline graph assembly and structural validation

use crate::core::step::StepDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// Errors detected while assembling or validating a pipeline graph.
///
/// All of these are fatal to compilation and never retried.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate step name: '{0}'")]
    DuplicateStepName(String),

    #[error("unknown step: '{0}'")]
    UnknownStep(String),

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("step '{step}' binds parameter '{param}' to {reason}")]
    DanglingParameterReference {
        step: String,
        param: String,
        reason: String,
    },

    #[error("step '{step}' references unknown pipeline parameter '{param}'")]
    UnknownPipelineParameter { step: String, param: String },
}

/// A pipeline-level parameter, bound by the caller at invocation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineParameter {
    pub name: String,

    /// Required parameters must be bound when a run starts
    #[serde(default)]
    pub required: bool,

    /// Default used when the caller leaves the parameter unbound
    #[serde(default)]
    pub default: Option<crate::core::value::OutputValue>,
}

/// An ordered dependency edge between two steps.
pub type Edge = (String, String);

/// A validated, immutable pipeline graph.
///
/// Produced only by [`GraphBuilder::build`]; holding one is proof that the
/// dependency relation (explicit edges plus edges implied by parameter
/// bindings and guards) is acyclic and every binding references a strict
/// predecessor's declared output.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    steps: BTreeMap<String, StepDescriptor>,
    edges: BTreeSet<Edge>,
    parameters: Vec<PipelineParameter>,
    topo_order: Vec<String>,
}

impl PipelineGraph {
    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name)
    }

    /// Steps in name order.
    pub fn steps(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn parameters(&self) -> &[PipelineParameter] {
        &self.parameters
    }

    /// A topological order over step names, stable across builds of the
    /// same graph (ties broken by name).
    pub fn topo_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Immediate upstreams of a step.
    pub fn upstreams_of(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, to)| to == name)
            .map(|(from, _)| from.as_str())
            .collect()
    }

    /// Immediate downstreams of a step.
    pub fn downstreams_of(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(from, _)| from == name)
            .map(|(_, to)| to.as_str())
            .collect()
    }
}

/// Assembles step descriptors and dependency edges into a [`PipelineGraph`].
///
/// Pure and side-effect free: the only outcome is the validated structure
/// (or a [`BuildError`]).
#[derive(Debug, Default)]
pub struct GraphBuilder {
    steps: BTreeMap<String, StepDescriptor>,
    explicit_edges: BTreeSet<Edge>,
    parameters: Vec<PipelineParameter>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step descriptor. The descriptor is consumed; it cannot be
    /// reconfigured after this point.
    pub fn add_step(&mut self, descriptor: StepDescriptor) -> Result<&mut Self, BuildError> {
        if self.steps.contains_key(&descriptor.name) {
            return Err(BuildError::DuplicateStepName(descriptor.name));
        }
        debug!(step = %descriptor.name, "registering step descriptor");
        self.steps.insert(descriptor.name.clone(), descriptor);
        Ok(self)
    }

    /// Declare an explicit dependency: `from` must finish before `to` runs.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<&mut Self, BuildError> {
        if !self.steps.contains_key(from) {
            return Err(BuildError::UnknownStep(from.to_string()));
        }
        if !self.steps.contains_key(to) {
            return Err(BuildError::UnknownStep(to.to_string()));
        }
        self.explicit_edges.insert((from.to_string(), to.to_string()));
        Ok(self)
    }

    /// Declare a pipeline-level parameter.
    pub fn add_parameter(&mut self, parameter: PipelineParameter) -> &mut Self {
        self.parameters.push(parameter);
        self
    }

    /// Validate structure and produce the immutable graph.
    ///
    /// Materializes implicit edges from parameter bindings and guards,
    /// collapses duplicates, then checks acyclicity and binding soundness.
    pub fn build(self) -> Result<PipelineGraph, BuildError> {
        let mut edges = self.explicit_edges;

        // Edges declared on the descriptors themselves.
        for step in self.steps.values() {
            for upstream in &step.depends_on {
                if !self.steps.contains_key(upstream) {
                    return Err(BuildError::UnknownStep(upstream.clone()));
                }
                edges.insert((upstream.clone(), step.name.clone()));
            }
        }

        // Implicit edges derived from bindings and guards, with reference
        // soundness checked as they are materialized.
        for step in self.steps.values() {
            for (param, (source, key)) in step
                .parameters
                .iter()
                .filter_map(|(param, binding)| match binding {
                    crate::core::step::ParamBinding::FromOutput { step, key } => {
                        Some((param.clone(), (step.as_str(), key.as_str())))
                    }
                    _ => None,
                })
                .chain(step.guard.iter().map(|g| {
                    (
                        "when".to_string(),
                        (g.source_step.as_str(), g.output_key.as_str()),
                    )
                }))
            {
                let producer = self.steps.get(source).ok_or_else(|| {
                    BuildError::DanglingParameterReference {
                        step: step.name.clone(),
                        param: param.clone(),
                        reason: format!("missing step '{}'", source),
                    }
                })?;
                if source == step.name {
                    return Err(BuildError::DanglingParameterReference {
                        step: step.name.clone(),
                        param,
                        reason: "its own output".to_string(),
                    });
                }
                if !producer.outputs.contains(key) {
                    return Err(BuildError::DanglingParameterReference {
                        step: step.name.clone(),
                        param,
                        reason: format!("undeclared output '{}' of step '{}'", key, source),
                    });
                }
                edges.insert((source.to_string(), step.name.clone()));
            }

            // Pipeline-parameter bindings must name a declared parameter.
            for binding in step.parameters.values() {
                if let crate::core::step::ParamBinding::PipelineParam(name) = binding {
                    if !self.parameters.iter().any(|p| &p.name == name) {
                        return Err(BuildError::UnknownPipelineParameter {
                            step: step.name.clone(),
                            param: name.clone(),
                        });
                    }
                }
            }
        }

        let topo_order = toposort(&self.steps, &edges)?;

        debug!(
            steps = self.steps.len(),
            edges = edges.len(),
            "pipeline graph validated"
        );

        Ok(PipelineGraph {
            steps: self.steps,
            edges,
            parameters: self.parameters,
            topo_order,
        })
    }
}

/// Depth-first topological sort over sorted step names so the result is
/// deterministic. Returns `CycleDetected` naming the offending cycle.
fn toposort(
    steps: &BTreeMap<String, StepDescriptor>,
    edges: &BTreeSet<Edge>,
) -> Result<Vec<String>, BuildError> {
    let mut upstreams: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        upstreams.entry(to.as_str()).or_default().push(from.as_str());
    }
    for deps in upstreams.values_mut() {
        deps.sort_unstable();
    }

    let mut order = Vec::with_capacity(steps.len());
    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_progress: Vec<&str> = Vec::new();

    fn visit<'a>(
        name: &'a str,
        upstreams: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        in_progress: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), BuildError> {
        if visited.contains(name) {
            return Ok(());
        }
        if let Some(pos) = in_progress.iter().position(|n| *n == name) {
            let mut cycle: Vec<String> =
                in_progress[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(name.to_string());
            return Err(BuildError::CycleDetected(cycle));
        }
        in_progress.push(name);
        if let Some(deps) = upstreams.get(name) {
            for dep in deps {
                visit(dep, upstreams, visited, in_progress, order)?;
            }
        }
        in_progress.pop();
        visited.insert(name);
        order.push(name.to_string());
        Ok(())
    }

    for name in steps.keys() {
        visit(
            name.as_str(),
            &upstreams,
            &mut visited,
            &mut in_progress,
            &mut order,
        )?;
    }

    Ok(order)
}
