//! Compiled workflow document

use crate::core::guard::Guard;
use crate::core::step::{PlacementConstraints, ResourceRequest, RetryPolicy};
use crate::core::value::OutputValue;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the shared workspace volume every node mounts.
pub const WORKSPACE_VOLUME: &str = "workspace";

/// Mount path of the shared workspace volume inside every container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// The self-contained execution document produced by compilation.
///
/// Everything a scheduler needs is in here; nothing refers back to the
/// source graph. All collections are ordered so that compiling the same
/// graph twice yields byte-identical serializations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledWorkflow {
    /// Workflow name, derived from the pipeline name
    pub name: String,

    /// Pipeline-level parameters the caller may bind at run time
    #[serde(default)]
    pub params: Vec<CompiledParam>,

    /// The shared volume nodes use to exchange bulk data
    pub volume: VolumeSpec,

    /// Executable nodes keyed by node id
    pub nodes: BTreeMap<String, CompiledNode>,

    /// Dependency edges (from, to) over node ids, sorted
    pub edges: Vec<(String, String)>,
}

/// A declared pipeline parameter carried into the compiled document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledParam {
    pub name: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<OutputValue>,
}

/// The shared workspace volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
}

impl Default for VolumeSpec {
    fn default() -> Self {
        Self {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: WORKSPACE_MOUNT.to_string(),
        }
    }
}

/// How a compiled node input gets its value at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompiledInput {
    /// Fixed value baked in at compile time
    Literal(OutputValue),

    /// Output published by an upstream node
    FromNode { node: String, key: String },

    /// Pipeline parameter bound by the caller
    Param(String),
}

/// One executable node of the compiled workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledNode {
    /// Source step name (node ids are derived, names are authored)
    pub step: String,

    /// Container image reference
    pub image: String,

    /// Command argument vector with unresolved `{{ name }}` placeholders
    pub command: Vec<String>,

    /// Private subtree of the shared volume for this node's bulk data
    pub work_dir: String,

    /// Named inputs resolved at dispatch time
    #[serde(default)]
    pub inputs: BTreeMap<String, CompiledInput>,

    /// Output keys this node publishes
    #[serde(default)]
    pub outputs: BTreeSet<String>,

    /// Resource request forwarded to the substrate
    pub resources: ResourceRequest,

    /// Placement constraints forwarded to the substrate
    #[serde(default, skip_serializing_if = "PlacementConstraints::is_empty")]
    pub placement: PlacementConstraints,

    /// Retry policy applied by the scheduler
    pub retry: RetryPolicy,

    /// Wall-clock budget in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Guard over an upstream output; source step name is already
    /// rewritten to a node id
    #[serde(default)]
    pub guard: Option<Guard>,
}

impl CompiledWorkflow {
    /// Serialize deterministically to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing compiled workflow")
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing compiled workflow")
    }

    /// Node ids of the immediate upstreams of a node.
    pub fn upstreams_of(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, to)| to == node_id)
            .map(|(from, _)| from.as_str())
            .collect()
    }

    /// Node ids of the immediate downstreams of a node.
    pub fn downstreams_of(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(from, _)| from == node_id)
            .map(|(_, to)| to.as_str())
            .collect()
    }

    /// All declared (node, output key) pairs, the legal channel key space.
    pub fn declared_outputs(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.nodes.iter().flat_map(|(id, node)| {
            node.outputs
                .iter()
                .map(move |key| (id.clone(), key.clone()))
        })
    }
}
