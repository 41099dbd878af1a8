//! Test utility functions for conveyor scenarios

use async_trait::async_trait;
use conveyor::core::OutputValue;
use conveyor::execution::{
    NodePhase, NodeSpec, RunInstance, SkipReason, SubmitHandle, Substrate, SubstrateError,
    SubstrateStatus,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Scripted result of one mock attempt.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed and publish these outputs
    Succeed(BTreeMap<String, OutputValue>),
    /// Fail with this error
    Fail(String),
    /// Keep running until cancelled
    Hang,
    /// Reject the submission itself with this error
    RejectSubmit(String),
}

struct MockJob {
    outcome: MockOutcome,
    cancelled: bool,
}

/// Substrate whose per-node outcomes are scripted up front.
///
/// Each submit for a node consumes the next scripted outcome; a node with
/// no script left succeeds with no outputs. Dispatches are recorded so
/// tests can assert on ordering.
pub struct MockSubstrate {
    scripts: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    jobs: Mutex<HashMap<u64, MockJob>>,
    dispatched: Mutex<Vec<String>>,
    next_handle: AtomicU64,
}

impl MockSubstrate {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            dispatched: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Script the outcomes of successive attempts of one node.
    pub fn script(self, node: &str, outcomes: Vec<MockOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(node.to_string(), outcomes.into());
        self
    }

    /// Node ids in the order they were submitted, including retries.
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Substrate for MockSubstrate {
    async fn submit(&self, spec: NodeSpec) -> Result<SubmitHandle, SubstrateError> {
        self.dispatched.lock().unwrap().push(spec.node_id.clone());
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&spec.node_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| MockOutcome::Succeed(BTreeMap::new()));

        if let MockOutcome::RejectSubmit(error) = outcome {
            return Err(SubstrateError::SubmitRejected(error));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.jobs.lock().unwrap().insert(
            handle,
            MockJob {
                outcome,
                cancelled: false,
            },
        );
        Ok(SubmitHandle(handle))
    }

    async fn poll(&self, handle: SubmitHandle) -> Result<SubstrateStatus, SubstrateError> {
        let jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get(&handle.0)
            .ok_or(SubstrateError::UnknownHandle(handle.0))?;
        if job.cancelled {
            return Ok(SubstrateStatus::Failed("cancelled".to_string()));
        }
        Ok(match &job.outcome {
            MockOutcome::Succeed(_) => SubstrateStatus::Succeeded,
            MockOutcome::Fail(error) | MockOutcome::RejectSubmit(error) => {
                SubstrateStatus::Failed(error.clone())
            }
            MockOutcome::Hang => SubstrateStatus::Running,
        })
    }

    async fn cancel(&self, handle: SubmitHandle) -> Result<(), SubstrateError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&handle.0)
            .ok_or(SubstrateError::UnknownHandle(handle.0))?;
        job.cancelled = true;
        Ok(())
    }

    async fn fetch_outputs(
        &self,
        handle: SubmitHandle,
    ) -> Result<BTreeMap<String, OutputValue>, SubstrateError> {
        let jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get(&handle.0)
            .ok_or(SubstrateError::UnknownHandle(handle.0))?;
        Ok(match &job.outcome {
            MockOutcome::Succeed(outputs) => outputs.clone(),
            _ => BTreeMap::new(),
        })
    }
}

/// Shorthand for a scripted success with outputs.
pub fn succeed_with(outputs: &[(&str, OutputValue)]) -> MockOutcome {
    MockOutcome::Succeed(
        outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

pub fn assert_succeeded(run: &RunInstance, node: &str) {
    assert!(
        matches!(run.node(node).unwrap().phase, NodePhase::Succeeded { .. }),
        "expected node '{}' to be Succeeded, was {:?}",
        node,
        run.node(node).unwrap().phase
    );
}

pub fn assert_skipped(run: &RunInstance, node: &str, reason: SkipReason) {
    assert_eq!(
        run.node(node).unwrap().phase,
        NodePhase::Skipped { reason },
        "expected node '{}' to be Skipped({:?})",
        node,
        reason
    );
}

pub fn assert_failed(run: &RunInstance, node: &str) {
    assert!(
        matches!(run.node(node).unwrap().phase, NodePhase::Failed { .. }),
        "expected node '{}' to be Failed, was {:?}",
        node,
        run.node(node).unwrap().phase
    );
}

/// Assert nodes were first dispatched in an order consistent with the
/// given precedence pairs.
pub fn assert_dispatched_before(run: &RunInstance, earlier: &str, later: &str) {
    let pos = |n: &str| {
        run.dispatch_order
            .iter()
            .position(|x| x == n)
            .unwrap_or_else(|| panic!("node '{}' was never dispatched", n))
    };
    assert!(
        pos(earlier) < pos(later),
        "expected '{}' to be dispatched before '{}' (order: {:?})",
        earlier,
        later,
        run.dispatch_order
    );
}
