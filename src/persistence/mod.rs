//! Persistence layer for workflow run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::execution::state::{NodePhase, RunInstance, RunStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run ID
    pub run_id: Uuid,

    /// Workflow name
    pub workflow: String,

    /// Final (or current) run status
    pub status: RunStatus,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal status (if it has)
    pub finished_at: Option<DateTime<Utc>>,

    /// Number of nodes that succeeded
    pub succeeded_nodes: usize,

    /// Number of nodes that were skipped
    pub skipped_nodes: usize,

    /// Total number of nodes
    pub total_nodes: usize,
}

/// Trait for run history backends
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Save a run summary
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// List runs of a workflow, newest first
    async fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>>;

    /// List all workflow names with recorded runs
    async fn list_workflows(&self) -> Result<Vec<String>>;
}

/// In-memory run history (for testing or ephemeral use)
pub struct InMemoryRunStore {
    runs: tokio::sync::RwLock<std::collections::HashMap<Uuid, RunSummary>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut result: Vec<RunSummary> = runs
            .values()
            .filter(|r| r.workflow == workflow)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_workflows(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|r| r.workflow.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Create a summary from a run instance
pub fn create_summary(run: &RunInstance) -> RunSummary {
    RunSummary {
        run_id: run.run_id,
        workflow: run.workflow.clone(),
        status: run.status.clone(),
        started_at: run.started_at.unwrap_or_else(Utc::now),
        finished_at: run.finished_at,
        succeeded_nodes: run
            .nodes
            .values()
            .filter(|n| matches!(n.phase, NodePhase::Succeeded { .. }))
            .count(),
        skipped_nodes: run
            .nodes
            .values()
            .filter(|n| matches!(n.phase, NodePhase::Skipped { .. }))
            .count(),
        total_nodes: run.nodes.len(),
    }
}
