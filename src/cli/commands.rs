//! CLI command definitions

use clap::Args;

/// Compile a pipeline manifest
#[derive(Debug, Args, Clone)]
pub struct CompileCommand {
    /// Path to pipeline manifest YAML
    #[arg(short, long)]
    pub file: String,

    /// Write the compiled workflow here instead of stdout
    #[arg(short, long)]
    pub output: Option<String>,
}

/// Validate a pipeline manifest
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline manifest YAML
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Compile and run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline manifest YAML
    #[arg(short, long)]
    pub file: String,

    /// Pipeline parameter bindings (name=value)
    #[arg(short, long, value_parser = parse_key_value)]
    pub param: Vec<(String, String)>,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Workflow name to filter by
    #[arg(short, long)]
    pub workflow: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show one run by id
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Parse a `name=value` argument
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}
