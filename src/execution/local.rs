//! Local process substrate - runs nodes as host processes
//!
//! Stands in for a real cluster substrate during development and testing.
//! The image reference is ignored; the command runs directly on the host
//! with the node's inputs exported as environment variables. Nodes publish
//! outputs by printing `::output <key>=<value>` lines on stdout.

use crate::core::value::OutputValue;
use crate::execution::substrate::{
    NodeSpec, SubmitHandle, Substrate, SubstrateError, SubstrateStatus,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Prefix nodes use to publish an output on stdout.
const OUTPUT_MARKER: &str = "::output ";

struct Job {
    child: Option<Child>,
    status: SubstrateStatus,
    stdout_lines: Arc<Mutex<Vec<String>>>,
    cancelled: bool,
}

/// Substrate that runs each node as a local process.
pub struct LocalProcessSubstrate {
    next_handle: AtomicU64,
    jobs: Mutex<HashMap<u64, Job>>,
}

impl LocalProcessSubstrate {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalProcessSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Substrate for LocalProcessSubstrate {
    async fn submit(&self, spec: NodeSpec) -> Result<SubmitHandle, SubstrateError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| SubstrateError::SubmitRejected("empty command".to_string()))?;

        tokio::fs::create_dir_all(&spec.work_dir).await?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (name, value) in &spec.env {
            command.env(name.to_ascii_uppercase(), value.to_string());
        }

        let mut child = command.spawn().map_err(|e| {
            SubstrateError::SubmitRejected(format!(
                "failed to spawn '{}' for node '{}': {}",
                program, spec.node_id, e
            ))
        })?;

        let stdout_lines = Arc::new(Mutex::new(Vec::new()));
        if let Some(stdout) = child.stdout.take() {
            let lines_sink = stdout_lines.clone();
            let node_id = spec.node_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(node = %node_id, "{}", line);
                    lines_sink.lock().await.push(line);
                }
            });
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.jobs.lock().await.insert(
            handle,
            Job {
                child: Some(child),
                status: SubstrateStatus::Running,
                stdout_lines,
                cancelled: false,
            },
        );
        debug!(node = %spec.node_id, handle, "node submitted as local process");
        Ok(SubmitHandle(handle))
    }

    async fn poll(&self, handle: SubmitHandle) -> Result<SubstrateStatus, SubstrateError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.0)
            .ok_or(SubstrateError::UnknownHandle(handle.0))?;

        if let Some(child) = job.child.as_mut() {
            if let Some(exit) = child.try_wait()? {
                job.child = None;
                job.status = if job.cancelled {
                    SubstrateStatus::Failed("cancelled".to_string())
                } else if exit.success() {
                    SubstrateStatus::Succeeded
                } else {
                    SubstrateStatus::Failed(format!(
                        "exited with code {}",
                        exit.code().unwrap_or(-1)
                    ))
                };
            }
        }
        Ok(job.status.clone())
    }

    async fn cancel(&self, handle: SubmitHandle) -> Result<(), SubstrateError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.0)
            .ok_or(SubstrateError::UnknownHandle(handle.0))?;

        if let Some(child) = job.child.as_mut() {
            job.cancelled = true;
            if let Err(e) = child.start_kill() {
                warn!(handle = handle.0, "failed to kill local process: {}", e);
            }
        }
        Ok(())
    }

    async fn fetch_outputs(
        &self,
        handle: SubmitHandle,
    ) -> Result<BTreeMap<String, OutputValue>, SubstrateError> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(&handle.0)
            .ok_or(SubstrateError::UnknownHandle(handle.0))?;

        let lines = job.stdout_lines.lock().await;
        Ok(parse_output_lines(&lines))
    }
}

/// Extract `::output key=value` declarations from captured stdout.
fn parse_output_lines(lines: &[String]) -> BTreeMap<String, OutputValue> {
    let mut outputs = BTreeMap::new();
    for line in lines {
        let Some(rest) = line.trim().strip_prefix(OUTPUT_MARKER) else {
            continue;
        };
        if let Some((key, value)) = rest.split_once('=') {
            outputs.insert(key.trim().to_string(), OutputValue::parse(value));
        }
    }
    outputs
}
