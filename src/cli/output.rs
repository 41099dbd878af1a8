//! CLI output formatting

use crate::execution::{NodePhase, RunEvent, RunStatus, SkipReason};
use crate::persistence::RunSummary;
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Format a node phase for display
pub fn format_node_phase(phase: &NodePhase) -> String {
    match phase {
        NodePhase::Waiting => style("WAITING").dim().to_string(),
        NodePhase::Ready => style("READY").cyan().to_string(),
        NodePhase::Dispatched { attempt, .. } => {
            style(format!("RUNNING (attempt {})", attempt)).yellow().to_string()
        }
        NodePhase::Succeeded { .. } => style("SUCCEEDED").green().to_string(),
        NodePhase::Failed { .. } => style("FAILED").red().to_string(),
        NodePhase::Skipped { reason } => {
            style(format!("SKIPPED ({})", format_skip_reason(*reason)))
                .dim()
                .to_string()
        }
        NodePhase::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

pub fn format_skip_reason(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::GuardFalse => "guard false",
        SkipReason::UpstreamFailed => "upstream failed",
        SkipReason::UpstreamSkipped => "upstream skipped",
    }
}

/// Format a run status for display
pub fn format_status(status: &RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        RunStatus::Failed { node, .. } => {
            style(format!("FAILED at {}", node)).red().to_string()
        }
        RunStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a run summary line for history listings
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed { .. } => CROSS,
        RunStatus::Running => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} - {} ({}/{} succeeded, {} skipped)",
        status_icon,
        style(&summary.run_id.to_string()[..8]).dim(),
        style(&summary.workflow).bold(),
        format_status(&summary.status),
        summary.succeeded_nodes,
        summary.total_nodes,
        summary.skipped_nodes,
    )
}

/// Format a run event for live console output
pub fn format_run_event(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::RunStarted { run_id, workflow } => Some(format!(
            "{} Starting workflow {} ({})",
            ROCKET,
            style(workflow).bold(),
            style(&run_id.to_string()[..8]).dim()
        )),
        RunEvent::NodeDispatched { node, attempt, .. } => {
            if *attempt > 1 {
                Some(format!(
                    "{} {} (attempt {})",
                    SPINNER,
                    style(node).cyan(),
                    style(attempt).dim()
                ))
            } else {
                Some(format!("{} {}", SPINNER, style(node).cyan()))
            }
        }
        RunEvent::NodeSucceeded { node, .. } => {
            Some(format!("{} {}", CHECK, style(node).green()))
        }
        RunEvent::NodeRetrying {
            node,
            attempt,
            max_retries,
            ..
        } => Some(format!(
            "{} {} retrying ({}/{} retries used)",
            WARN,
            style(node).yellow(),
            attempt - 1,
            max_retries
        )),
        RunEvent::NodeFailed { node, error, .. } => Some(format!(
            "{} {} failed: {}",
            CROSS,
            style(node).red(),
            style(error).dim()
        )),
        RunEvent::NodeSkipped { node, reason, .. } => Some(format!(
            "{} {} skipped ({})",
            SKIP,
            style(node).dim(),
            format_skip_reason(*reason)
        )),
        RunEvent::RunFinished { status, .. } => {
            Some(format!("{} Run {}", INFO, format_status(status)))
        }
        RunEvent::NodeReady { .. } => None,
    }
}

/// Format a duration compactly
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
