//! Runner - owns the lifecycle of concurrent workflow runs

use crate::compile::workflow::CompiledWorkflow;
use crate::core::value::OutputValue;
use crate::execution::engine::{EngineError, RunEngine, RunEvent};
use crate::execution::state::{NodePhase, RunInstance, RunStatus};
use crate::execution::substrate::Substrate;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

struct ActiveRun {
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<Result<RunInstance, EngineError>>>,
}

type SnapshotMap = Arc<Mutex<HashMap<Uuid, RunInstance>>>;

/// Starts, observes, and cancels runs against one substrate.
///
/// Each run executes on its own task. Snapshots are maintained from the
/// engine's event stream, so `status` and `snapshot` never block on a run
/// in progress.
pub struct Runner<S> {
    engine: Arc<RunEngine<S>>,
    runs: Mutex<HashMap<Uuid, ActiveRun>>,
    snapshots: SnapshotMap,
}

impl<S: Substrate + 'static> Runner<S> {
    pub fn new(engine: RunEngine<S>) -> Self {
        let snapshots: SnapshotMap = Arc::new(Mutex::new(HashMap::new()));

        let sink = snapshots.clone();
        engine.add_event_handler(move |event| apply_event(&sink, &event));

        Self {
            engine: Arc::new(engine),
            runs: Mutex::new(HashMap::new()),
            snapshots,
        }
    }

    pub fn engine(&self) -> &RunEngine<S> {
        &self.engine
    }

    /// Start a run of the workflow and return its id immediately.
    pub fn start(
        &self,
        workflow: CompiledWorkflow,
        params: BTreeMap<String, OutputValue>,
    ) -> Uuid {
        let mut run =
            RunInstance::new(&workflow.name, workflow.nodes.keys().cloned()).with_params(params);
        let run_id = run.run_id;
        let cancel = Arc::new(AtomicBool::new(false));

        self.snapshots.lock().unwrap().insert(run_id, run.clone());

        let engine = self.engine.clone();
        let cancel_for_task = cancel.clone();
        let snapshots = self.snapshots.clone();
        let join = tokio::spawn(async move {
            let outcome = engine
                .execute_interruptible(&workflow, &mut run, cancel_for_task)
                .await;
            // An Err here means the run was rejected before any node was
            // dispatched (e.g. an unbound required parameter).
            if let Err(e) = &outcome {
                run.finish(RunStatus::Failed {
                    node: String::new(),
                    error: e.to_string(),
                });
            }
            // The final instance is authoritative; replace the
            // event-reconstructed snapshot with it. An evicted run stays
            // evicted.
            if let Some(slot) = snapshots.lock().unwrap().get_mut(&run_id) {
                *slot = run.clone();
            }
            outcome.map(|_| run)
        });

        self.runs.lock().unwrap().insert(
            run_id,
            ActiveRun {
                cancel,
                join: Some(join),
            },
        );
        run_id
    }

    /// Current status of a run, if the runner knows it.
    pub fn status(&self, run_id: Uuid) -> Option<RunStatus> {
        self.snapshots
            .lock()
            .unwrap()
            .get(&run_id)
            .map(|run| run.status.clone())
    }

    /// Point-in-time view of a run: per-node phase, attempts, last error.
    pub fn snapshot(&self, run_id: Uuid) -> Option<RunInstance> {
        self.snapshots.lock().unwrap().get(&run_id).cloned()
    }

    /// Request cancellation. Safe to call repeatedly or on a finished run;
    /// returns false only for an unknown run id.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.runs.lock().unwrap().get(&run_id) {
            Some(active) => {
                active.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Wait for a run to finish and take its final state.
    pub async fn wait(&self, run_id: Uuid) -> Option<Result<RunInstance, EngineError>> {
        let join = self
            .runs
            .lock()
            .unwrap()
            .get_mut(&run_id)
            .and_then(|r| r.join.take())?;
        match join.await {
            Ok(outcome) => Some(outcome),
            Err(e) => Some(Err(EngineError::RunPanicked(e.to_string()))),
        }
    }

    /// Drop all bookkeeping for a finished run.
    ///
    /// Returns the final snapshot, or None if the run is unknown or still
    /// in progress. Long-lived runners call this to keep their run maps
    /// from growing without bound.
    pub fn evict(&self, run_id: Uuid) -> Option<RunInstance> {
        let mut snapshots = self.snapshots.lock().unwrap();
        if !snapshots.get(&run_id)?.status.is_terminal() {
            return None;
        }
        self.runs.lock().unwrap().remove(&run_id);
        snapshots.remove(&run_id)
    }
}

/// Fold one engine event into the snapshot map.
fn apply_event(snapshots: &SnapshotMap, event: &RunEvent) {
    let mut snapshots = snapshots.lock().unwrap();
    match event {
        RunEvent::RunStarted { run_id, .. } => {
            if let Some(run) = snapshots.get_mut(run_id) {
                run.start();
            }
        }
        RunEvent::NodeReady { run_id, node } => {
            if let Some(record) = snapshots.get_mut(run_id).and_then(|r| r.nodes.get_mut(node)) {
                record.phase = NodePhase::Ready;
            }
        }
        RunEvent::NodeDispatched {
            run_id,
            node,
            attempt,
        } => {
            if let Some(run) = snapshots.get_mut(run_id) {
                if *attempt == 1 {
                    run.dispatch_order.push(node.clone());
                }
                if let Some(record) = run.nodes.get_mut(node) {
                    record.attempts = *attempt;
                    record.phase = NodePhase::Dispatched {
                        started_at: Utc::now(),
                        attempt: *attempt,
                    };
                }
            }
        }
        RunEvent::NodeSucceeded {
            run_id,
            node,
            attempts,
        } => {
            if let Some(record) = snapshots.get_mut(run_id).and_then(|r| r.nodes.get_mut(node)) {
                record.attempts = *attempts;
                record.phase = NodePhase::Succeeded {
                    attempts: *attempts,
                    finished_at: Utc::now(),
                };
            }
        }
        RunEvent::NodeRetrying { run_id, node, .. } => {
            if let Some(record) = snapshots.get_mut(run_id).and_then(|r| r.nodes.get_mut(node)) {
                record.phase = NodePhase::Ready;
            }
        }
        RunEvent::NodeFailed {
            run_id,
            node,
            error,
            attempts,
        } => {
            if let Some(record) = snapshots.get_mut(run_id).and_then(|r| r.nodes.get_mut(node)) {
                record.attempts = *attempts;
                record.last_error = Some(error.clone());
                record.phase = NodePhase::Failed {
                    error: error.clone(),
                    attempts: *attempts,
                    finished_at: Utc::now(),
                };
            }
        }
        RunEvent::NodeSkipped {
            run_id,
            node,
            reason,
        } => {
            if let Some(record) = snapshots.get_mut(run_id).and_then(|r| r.nodes.get_mut(node)) {
                record.phase = NodePhase::Skipped { reason: *reason };
            }
        }
        RunEvent::RunFinished { run_id, status } => {
            if let Some(run) = snapshots.get_mut(run_id) {
                if matches!(status, RunStatus::Cancelled) {
                    for record in run.nodes.values_mut() {
                        if !record.phase.is_terminal() {
                            record.phase = NodePhase::Cancelled;
                        }
                    }
                }
                run.finish(status.clone());
            }
        }
    }
}
