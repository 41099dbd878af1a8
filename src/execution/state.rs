//! Run state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::value::OutputValue;

/// Why a node was skipped rather than dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Its guard evaluated to false
    GuardFalse,
    /// An upstream node failed
    UpstreamFailed,
    /// An upstream node whose outputs it binds was skipped
    UpstreamSkipped,
}

/// State of a single node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodePhase {
    /// Upstreams not yet satisfied
    Waiting,
    /// All upstreams satisfied, eligible for dispatch
    Ready,
    /// Handed to the substrate and running
    Dispatched {
        started_at: DateTime<Utc>,
        attempt: u32,
    },
    /// Finished and outputs published
    Succeeded {
        attempts: u32,
        finished_at: DateTime<Utc>,
    },
    /// All attempts exhausted
    Failed {
        error: String,
        attempts: u32,
        finished_at: DateTime<Utc>,
    },
    /// Never dispatched (or never finished) for the given reason
    Skipped { reason: SkipReason },
    /// Run was cancelled before the node reached a terminal phase
    Cancelled,
}

impl NodePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodePhase::Succeeded { .. }
                | NodePhase::Failed { .. }
                | NodePhase::Skipped { .. }
                | NodePhase::Cancelled
        )
    }

    /// Whether this phase satisfies a downstream's ordering dependency.
    ///
    /// Succeeded always does; Skipped does as well unless the downstream
    /// binds this node's outputs, which the scheduler checks separately.
    pub fn satisfies_ordering(&self) -> bool {
        matches!(self, NodePhase::Succeeded { .. } | NodePhase::Skipped { .. })
    }
}

/// Per-node execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub phase: NodePhase,

    /// Attempts made so far (0 until first dispatch)
    pub attempts: u32,

    /// Outputs published by the successful attempt
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputValue>,

    /// Error from the most recent failed attempt
    #[serde(default)]
    pub last_error: Option<String>,
}

impl NodeExecution {
    pub fn new() -> Self {
        Self {
            phase: NodePhase::Waiting,
            attempts: 0,
            outputs: BTreeMap::new(),
            last_error: None,
        }
    }
}

impl Default for NodeExecution {
    fn default() -> Self {
        Self::new()
    }
}

/// Overall run status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has not started
    Pending,
    /// Run is in progress
    Running,
    /// Every node reached Succeeded or Skipped
    Succeeded,
    /// At least one node failed
    Failed { node: String, error: String },
    /// The run was cancelled
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

/// Complete state of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInstance {
    /// Unique run ID
    pub run_id: Uuid,

    /// Name of the compiled workflow being run
    pub workflow: String,

    /// Current run status
    pub status: RunStatus,

    /// Caller-supplied pipeline parameter values
    #[serde(default)]
    pub params: BTreeMap<String, OutputValue>,

    /// Per-node execution records, keyed by node id
    pub nodes: BTreeMap<String, NodeExecution>,

    /// Node ids in the order they were first dispatched
    #[serde(default)]
    pub dispatch_order: Vec<String>,

    /// When the run started
    pub started_at: Option<DateTime<Utc>>,

    /// When the run reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunInstance {
    pub fn new(workflow: &str, node_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow: workflow.to_string(),
            status: RunStatus::Pending,
            params: BTreeMap::new(),
            nodes: node_ids
                .into_iter()
                .map(|id| (id, NodeExecution::new()))
                .collect(),
            dispatch_order: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, OutputValue>) -> Self {
        self.params = params;
        self
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn node(&self, id: &str) -> Option<&NodeExecution> {
        self.nodes.get(id)
    }

    /// Whether every node has reached a terminal phase.
    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.phase.is_terminal())
    }

    /// The first failed node, if any, in node-id order.
    pub fn first_failure(&self) -> Option<(&str, &str)> {
        self.nodes.iter().find_map(|(id, n)| match &n.phase {
            NodePhase::Failed { error, .. } => Some((id.as_str(), error.as_str())),
            _ => None,
        })
    }
}
