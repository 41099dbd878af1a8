//! Substrate contract - the seam between the scheduler and whatever
//! actually runs containers

use crate::core::step::{PlacementConstraints, ResourceRequest};
use crate::core::value::OutputValue;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from substrate interactions.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("submission rejected: {0}")]
    SubmitRejected(String),

    #[error("unknown execution handle {0}")]
    UnknownHandle(u64),

    #[error("substrate i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle to one submitted execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmitHandle(pub u64);

/// Observed status of a submitted execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// A fully resolved unit of work, ready to run. All placeholders are
/// already substituted; the substrate never sees a binding.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// Node id within the run, used for log attribution
    pub node_id: String,

    /// Container image reference
    pub image: String,

    /// Resolved command argument vector
    pub command: Vec<String>,

    /// Working directory (the node's subtree of the shared volume)
    pub work_dir: String,

    /// Resolved inputs, exported to the execution environment
    pub env: BTreeMap<String, OutputValue>,

    pub resources: ResourceRequest,
    pub placement: PlacementConstraints,
}

/// What the scheduler requires from an execution substrate.
///
/// Implementations own process or container lifecycles; the scheduler only
/// submits, polls, cancels, and collects outputs. Polling the same handle
/// after completion must keep returning the terminal status.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Submit a node for execution.
    async fn submit(&self, spec: NodeSpec) -> Result<SubmitHandle, SubstrateError>;

    /// Observe the current status of a submitted execution.
    async fn poll(&self, handle: SubmitHandle) -> Result<SubstrateStatus, SubstrateError>;

    /// Request cancellation of a submitted execution. Idempotent; safe on
    /// already-terminal executions.
    async fn cancel(&self, handle: SubmitHandle) -> Result<(), SubstrateError>;

    /// Collect the outputs a succeeded execution published.
    async fn fetch_outputs(
        &self,
        handle: SubmitHandle,
    ) -> Result<BTreeMap<String, OutputValue>, SubstrateError>;
}
