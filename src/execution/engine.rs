//! Run engine - drives a compiled workflow to completion
//!
//! The engine is the single writer of run state: nodes move through
//! Waiting -> Ready -> Dispatched -> terminal inside one scheduling loop,
//! so no phase transition ever races another.

use crate::channel::OutputChannel;
use crate::compile::workflow::{CompiledInput, CompiledNode, CompiledWorkflow};
use crate::core::value::OutputValue;
use crate::execution::state::{NodePhase, RunInstance, RunStatus, SkipReason};
use crate::execution::substrate::{NodeSpec, SubmitHandle, Substrate, SubstrateStatus};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors that abort a run before any node is dispatched. Everything that
/// goes wrong after that point is charged to a node and settles through its
/// retry policy, so the run always reaches a terminal status.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("required pipeline parameter '{0}' was not bound")]
    MissingParam(String),

    #[error("run task panicked: {0}")]
    RunPanicked(String),
}

/// Events emitted as a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
    },
    NodeReady {
        run_id: Uuid,
        node: String,
    },
    NodeDispatched {
        run_id: Uuid,
        node: String,
        attempt: u32,
    },
    NodeSucceeded {
        run_id: Uuid,
        node: String,
        attempts: u32,
    },
    NodeRetrying {
        run_id: Uuid,
        node: String,
        attempt: u32,
        max_retries: u32,
    },
    NodeFailed {
        run_id: Uuid,
        node: String,
        error: String,
        attempts: u32,
    },
    NodeSkipped {
        run_id: Uuid,
        node: String,
        reason: SkipReason,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// Bookkeeping for one dispatched attempt.
struct InFlight {
    handle: SubmitHandle,
    deadline: Option<Instant>,
}

/// Drives runs of compiled workflows against a substrate.
pub struct RunEngine<S> {
    substrate: Arc<S>,
    event_handlers: Mutex<Vec<EventHandler>>,
    poll_interval: std::time::Duration,
}

impl<S: Substrate + 'static> RunEngine<S> {
    pub fn new(substrate: S) -> Self {
        Self {
            substrate: Arc::new(substrate),
            event_handlers: Mutex::new(Vec::new()),
            poll_interval: std::time::Duration::from_millis(25),
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(RunEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().unwrap().push(Arc::new(handler));
    }

    fn emit(&self, event: RunEvent) {
        let handlers = self.event_handlers.lock().unwrap();
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Execute a run to completion.
    pub async fn execute(
        &self,
        workflow: &CompiledWorkflow,
        run: &mut RunInstance,
    ) -> Result<RunStatus, EngineError> {
        self.execute_interruptible(workflow, run, Arc::new(AtomicBool::new(false)))
            .await
    }

    /// Execute a run, stopping early when `cancel` is raised.
    ///
    /// Cancellation is idempotent: once observed, every in-flight node is
    /// cancelled on the substrate and every non-terminal node becomes
    /// `Cancelled`; raising the flag again has no further effect.
    pub async fn execute_interruptible(
        &self,
        workflow: &CompiledWorkflow,
        run: &mut RunInstance,
        cancel: Arc<AtomicBool>,
    ) -> Result<RunStatus, EngineError> {
        bind_params(workflow, run)?;

        let mut channel = OutputChannel::new(workflow.declared_outputs());
        let mut in_flight: HashMap<String, InFlight> = HashMap::new();
        let mut retry_at: HashMap<String, Instant> = HashMap::new();

        run.start();
        info!(run_id = %run.run_id, workflow = %workflow.name, "run started");
        self.emit(RunEvent::RunStarted {
            run_id: run.run_id,
            workflow: workflow.name.clone(),
        });

        let status = loop {
            if cancel.load(Ordering::SeqCst) {
                self.cancel_in_flight(&in_flight).await;
                for (id, node) in run.nodes.iter_mut() {
                    if !node.phase.is_terminal() {
                        debug!(node = %id, "node cancelled");
                        node.phase = NodePhase::Cancelled;
                    }
                }
                break RunStatus::Cancelled;
            }

            self.promote_waiting(workflow, run, &channel);
            self.dispatch_ready(workflow, run, &mut in_flight, &mut retry_at, &channel)
                .await;
            self.poll_in_flight(workflow, run, &mut in_flight, &mut retry_at, &mut channel)
                .await;

            if run.all_terminal() {
                break match run.first_failure() {
                    Some((node, error)) => RunStatus::Failed {
                        node: node.to_string(),
                        error: error.to_string(),
                    },
                    None => RunStatus::Succeeded,
                };
            }

            tokio::time::sleep(self.poll_interval).await;
        };

        run.finish(status.clone());
        info!(run_id = %run.run_id, status = ?status, "run finished");
        self.emit(RunEvent::RunFinished {
            run_id: run.run_id,
            status: status.clone(),
        });
        Ok(status)
    }

    /// Move Waiting nodes forward once their upstreams settle.
    fn promote_waiting(
        &self,
        workflow: &CompiledWorkflow,
        run: &mut RunInstance,
        channel: &OutputChannel,
    ) {
        let ids: Vec<String> = run
            .nodes
            .iter()
            .filter(|(_, n)| n.phase == NodePhase::Waiting)
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            let node = &workflow.nodes[&id];
            let upstreams = workflow.upstreams_of(&id);

            if !upstreams
                .iter()
                .all(|up| run.nodes[*up].phase.satisfies_ordering())
            {
                continue;
            }

            // A skipped upstream satisfies ordering, but not data flow: a
            // node that binds its outputs can never resolve them.
            let starved = bound_nodes(node)
                .into_iter()
                .any(|up| matches!(run.nodes[up].phase, NodePhase::Skipped { .. }));
            if starved {
                self.skip_node(run, &id, SkipReason::UpstreamSkipped);
                continue;
            }

            if let Some(guard) = &node.guard {
                let holds = channel
                    .resolve(&guard.source_step, &guard.output_key)
                    .map(|value| guard.evaluate(value))
                    .unwrap_or(false);
                if !holds {
                    debug!(node = %id, guard = %guard, "guard is false, skipping");
                    self.skip_node(run, &id, SkipReason::GuardFalse);
                    continue;
                }
            }

            run.nodes.get_mut(&id).unwrap().phase = NodePhase::Ready;
            self.emit(RunEvent::NodeReady {
                run_id: run.run_id,
                node: id,
            });
        }
    }

    /// Submit every Ready node whose backoff window (if any) has elapsed.
    ///
    /// A rejected submission is a failed attempt for that node, not a run
    /// abort, so a transiently unavailable substrate is absorbed by the
    /// node's retry policy.
    async fn dispatch_ready(
        &self,
        workflow: &CompiledWorkflow,
        run: &mut RunInstance,
        in_flight: &mut HashMap<String, InFlight>,
        retry_at: &mut HashMap<String, Instant>,
        channel: &OutputChannel,
    ) {
        let now = Instant::now();
        let ids: Vec<String> = run
            .nodes
            .iter()
            .filter(|(id, n)| {
                n.phase == NodePhase::Ready
                    && retry_at.get(id.as_str()).is_none_or(|at| *at <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            retry_at.remove(&id);
            let node = &workflow.nodes[&id];
            let env = match resolve_inputs(node, run, channel) {
                Ok(env) => env,
                Err(error) => {
                    run.nodes.get_mut(&id).unwrap().attempts += 1;
                    self.settle_failed_attempt(workflow, run, retry_at, &id, error);
                    continue;
                }
            };
            let spec = NodeSpec {
                node_id: id.clone(),
                image: node.image.clone(),
                command: render_command(&node.command, &env),
                work_dir: node.work_dir.clone(),
                env,
                resources: node.resources,
                placement: node.placement.clone(),
            };

            let handle = match self.substrate.submit(spec).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(node = %id, "submit failed: {}", e);
                    run.nodes.get_mut(&id).unwrap().attempts += 1;
                    self.settle_failed_attempt(workflow, run, retry_at, &id, e.to_string());
                    continue;
                }
            };
            let record = run.nodes.get_mut(&id).unwrap();
            record.attempts += 1;
            let attempt = record.attempts;
            record.phase = NodePhase::Dispatched {
                started_at: Utc::now(),
                attempt,
            };
            if attempt == 1 {
                run.dispatch_order.push(id.clone());
            }

            in_flight.insert(
                id.clone(),
                InFlight {
                    handle,
                    deadline: node
                        .timeout_secs
                        .map(|secs| now + std::time::Duration::from_secs(secs)),
                },
            );
            debug!(node = %id, attempt, "node dispatched");
            self.emit(RunEvent::NodeDispatched {
                run_id: run.run_id,
                node: id,
                attempt,
            });
        }
    }

    /// Observe in-flight attempts and settle the finished ones.
    ///
    /// A transport error while polling or fetching outputs fails the
    /// attempt it belongs to; the node's retry policy decides what happens
    /// next.
    async fn poll_in_flight(
        &self,
        workflow: &CompiledWorkflow,
        run: &mut RunInstance,
        in_flight: &mut HashMap<String, InFlight>,
        retry_at: &mut HashMap<String, Instant>,
        channel: &mut OutputChannel,
    ) {
        let now = Instant::now();
        let ids: Vec<String> = in_flight.keys().cloned().collect();

        for id in ids {
            let flight = &in_flight[&id];
            let node = &workflow.nodes[&id];

            if flight.deadline.is_some_and(|deadline| now >= deadline) {
                let handle = flight.handle;
                in_flight.remove(&id);
                if let Err(e) = self.substrate.cancel(handle).await {
                    warn!(node = %id, "cancel of timed-out attempt failed: {}", e);
                }
                let error = format!(
                    "timed out after {}s",
                    node.timeout_secs.unwrap_or_default()
                );
                warn!(node = %id, "{}", error);
                self.settle_failed_attempt(workflow, run, retry_at, &id, error);
                continue;
            }

            match self.substrate.poll(flight.handle).await {
                Ok(SubstrateStatus::Running) => {}
                Ok(SubstrateStatus::Succeeded) => {
                    let handle = flight.handle;
                    in_flight.remove(&id);
                    let outputs = match self.substrate.fetch_outputs(handle).await {
                        Ok(outputs) => outputs,
                        Err(e) => {
                            warn!(node = %id, "fetching outputs failed: {}", e);
                            self.settle_failed_attempt(
                                workflow,
                                run,
                                retry_at,
                                &id,
                                e.to_string(),
                            );
                            continue;
                        }
                    };
                    match publish_outputs(node, &id, outputs, channel) {
                        Ok(published) => {
                            let record = run.nodes.get_mut(&id).unwrap();
                            record.outputs = published;
                            let attempts = record.attempts;
                            record.phase = NodePhase::Succeeded {
                                attempts,
                                finished_at: Utc::now(),
                            };
                            info!(node = %id, attempts, "node succeeded");
                            self.emit(RunEvent::NodeSucceeded {
                                run_id: run.run_id,
                                node: id,
                                attempts,
                            });
                        }
                        Err(error) => {
                            self.settle_failed_attempt(workflow, run, retry_at, &id, error)
                        }
                    }
                }
                Ok(SubstrateStatus::Failed(error)) => {
                    in_flight.remove(&id);
                    self.settle_failed_attempt(workflow, run, retry_at, &id, error);
                }
                Err(e) => {
                    in_flight.remove(&id);
                    warn!(node = %id, "poll failed: {}", e);
                    self.settle_failed_attempt(workflow, run, retry_at, &id, e.to_string());
                }
            }
        }
    }

    /// Record a failed attempt: schedule a retry while the policy allows,
    /// otherwise fail the node and skip everything downstream of it.
    fn settle_failed_attempt(
        &self,
        workflow: &CompiledWorkflow,
        run: &mut RunInstance,
        retry_at: &mut HashMap<String, Instant>,
        id: &str,
        error: String,
    ) {
        let node = &workflow.nodes[id];
        let record = run.nodes.get_mut(id).unwrap();
        record.last_error = Some(error.clone());
        let retries_used = record.attempts.saturating_sub(1);

        if retries_used < node.retry.max_retries {
            let attempt = record.attempts + 1;
            let backoff = node.retry.backoff_for(record.attempts);
            record.phase = NodePhase::Ready;
            retry_at.insert(id.to_string(), Instant::now() + backoff);
            warn!(
                node = %id,
                attempt,
                max_retries = node.retry.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                "attempt failed, retrying: {}", error
            );
            self.emit(RunEvent::NodeRetrying {
                run_id: run.run_id,
                node: id.to_string(),
                attempt,
                max_retries: node.retry.max_retries,
            });
        } else {
            let attempts = record.attempts;
            record.phase = NodePhase::Failed {
                error: error.clone(),
                attempts,
                finished_at: Utc::now(),
            };
            error!(node = %id, attempts, "node failed: {}", error);
            self.emit(RunEvent::NodeFailed {
                run_id: run.run_id,
                node: id.to_string(),
                error,
                attempts,
            });
            self.skip_downstream_of(workflow, run, id);
        }
    }

    /// Walk everything reachable from a failed node and skip it.
    fn skip_downstream_of(&self, workflow: &CompiledWorkflow, run: &mut RunInstance, id: &str) {
        let mut queue: VecDeque<&str> = workflow.downstreams_of(id).into();
        while let Some(next) = queue.pop_front() {
            if run.nodes[next].phase.is_terminal() {
                continue;
            }
            self.skip_node(run, next, SkipReason::UpstreamFailed);
            queue.extend(workflow.downstreams_of(next));
        }
    }

    fn skip_node(&self, run: &mut RunInstance, id: &str, reason: SkipReason) {
        run.nodes.get_mut(id).unwrap().phase = NodePhase::Skipped { reason };
        debug!(node = %id, ?reason, "node skipped");
        self.emit(RunEvent::NodeSkipped {
            run_id: run.run_id,
            node: id.to_string(),
            reason,
        });
    }

    async fn cancel_in_flight(&self, in_flight: &HashMap<String, InFlight>) {
        for (id, flight) in in_flight {
            if let Err(e) = self.substrate.cancel(flight.handle).await {
                warn!(node = %id, "cancel failed: {}", e);
            }
        }
    }
}

/// Check required pipeline parameters and fill in defaults.
fn bind_params(workflow: &CompiledWorkflow, run: &mut RunInstance) -> Result<(), EngineError> {
    for param in &workflow.params {
        if run.params.contains_key(&param.name) {
            continue;
        }
        match (&param.default, param.required) {
            (Some(default), _) => {
                run.params.insert(param.name.clone(), default.clone());
            }
            (None, true) => return Err(EngineError::MissingParam(param.name.clone())),
            (None, false) => {}
        }
    }
    Ok(())
}

/// Node ids whose outputs this node binds, through inputs or its guard.
fn bound_nodes(node: &CompiledNode) -> Vec<&str> {
    let mut nodes: Vec<&str> = node
        .inputs
        .values()
        .filter_map(|input| match input {
            CompiledInput::FromNode { node, .. } => Some(node.as_str()),
            _ => None,
        })
        .collect();
    if let Some(guard) = &node.guard {
        nodes.push(guard.source_step.as_str());
    }
    nodes
}

/// Resolve every input of a node to a concrete value.
///
/// By the time a node is dispatched its bound upstreams have succeeded and
/// required parameters are bound, so a failure here is charged to the
/// attempt rather than aborting the run.
fn resolve_inputs(
    node: &CompiledNode,
    run: &RunInstance,
    channel: &OutputChannel,
) -> Result<BTreeMap<String, OutputValue>, String> {
    let mut env = BTreeMap::new();
    for (name, input) in &node.inputs {
        let value = match input {
            CompiledInput::Literal(v) => v.clone(),
            CompiledInput::FromNode { node, key } => channel
                .resolve(node, key)
                .map_err(|e| e.to_string())?
                .clone(),
            CompiledInput::Param(p) => run
                .params
                .get(p)
                .cloned()
                .ok_or_else(|| format!("unbound pipeline parameter '{}'", p))?,
        };
        env.insert(name.clone(), value);
    }
    Ok(env)
}

/// Substitute `{{ name }}` placeholders in the command with input values.
fn render_command(command: &[String], env: &BTreeMap<String, OutputValue>) -> Vec<String> {
    command
        .iter()
        .map(|arg| {
            let mut rendered = arg.clone();
            for (name, value) in env {
                let spaced = format!("{{{{ {} }}}}", name);
                let tight = format!("{{{{{}}}}}", name);
                rendered = rendered
                    .replace(&spaced, &value.to_string())
                    .replace(&tight, &value.to_string());
            }
            rendered
        })
        .collect()
}

/// Publish a succeeded attempt's outputs, requiring every declared key.
fn publish_outputs(
    node: &CompiledNode,
    id: &str,
    outputs: BTreeMap<String, OutputValue>,
    channel: &mut OutputChannel,
) -> Result<BTreeMap<String, OutputValue>, String> {
    for key in outputs.keys() {
        if !node.outputs.contains(key) {
            return Err(format!("published undeclared output '{}'", key));
        }
    }
    for key in &node.outputs {
        if !outputs.contains_key(key) {
            return Err(format!("did not publish declared output '{}'", key));
        }
    }
    for (key, value) in &outputs {
        channel
            .publish(id, key, value.clone())
            .map_err(|e| e.to_string())?;
    }
    Ok(outputs)
}
