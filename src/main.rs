use anyhow::{Context, Result};
use conveyor::cli::commands::{CompileCommand, HistoryCommand, RunCommand, ValidateCommand};
use conveyor::cli::output::*;
use conveyor::cli::{Cli, Command};
use conveyor::core::{OutputValue, PipelineManifest};
use conveyor::execution::{LocalProcessSubstrate, RunEngine, RunInstance};
use conveyor::persistence::create_summary;
#[cfg(feature = "sqlite")]
use conveyor::persistence::{RunStore, SqliteRunStore};
use std::collections::BTreeMap;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Compile(cmd) => compile_manifest(cmd)?,
        Command::Validate(cmd) => validate_manifest(cmd)?,
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

fn load_and_compile(file: &str) -> Result<conveyor::CompiledWorkflow> {
    let manifest = PipelineManifest::from_file(file).context("Failed to load pipeline manifest")?;
    let name = manifest.name.clone();
    let graph = manifest.into_graph()?;
    Ok(conveyor::compile(&graph, &name)?)
}

fn compile_manifest(cmd: &CompileCommand) -> Result<()> {
    let workflow = load_and_compile(&cmd.file)?;
    let yaml = workflow.to_yaml()?;

    match &cmd.output {
        Some(path) => {
            std::fs::write(path, &yaml)
                .with_context(|| format!("Failed to write {}", path))?;
            println!(
                "{} Compiled {} ({} nodes) to {}",
                CHECK,
                style(&workflow.name).bold(),
                style(workflow.nodes.len()).cyan(),
                style(path).dim()
            );
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

fn validate_manifest(cmd: &ValidateCommand) -> Result<()> {
    match load_and_compile(&cmd.file) {
        Ok(workflow) => {
            println!("{} Pipeline manifest is valid!", CHECK);
            println!("  Name: {}", style(&workflow.name).bold());
            println!("  Nodes: {}", style(workflow.nodes.len()).cyan());
            println!("  Edges: {}", style(workflow.edges.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&workflow)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let workflow = load_and_compile(&cmd.file)?;
    println!(
        "{} Compiled workflow: {}",
        INFO,
        style(&workflow.name).bold()
    );

    let params: BTreeMap<String, OutputValue> = cmd
        .param
        .iter()
        .map(|(name, value)| (name.clone(), OutputValue::parse(value)))
        .collect();
    for (name, value) in &params {
        println!(
            "{} Parameter: {} = {}",
            INFO,
            style(name).cyan(),
            style(value).dim()
        );
    }

    let engine = RunEngine::new(LocalProcessSubstrate::new());
    engine.add_event_handler(|event| {
        if let Some(line) = format_run_event(&event) {
            println!("{}", line);
        }
    });

    let mut run =
        RunInstance::new(&workflow.name, workflow.nodes.keys().cloned()).with_params(params);

    println!();
    let status = engine.execute(&workflow, &mut run).await?;

    #[cfg(feature = "sqlite")]
    if !cmd.no_history {
        let store = SqliteRunStore::with_default_path().await?;
        let summary = create_summary(&run);
        store.save_run(&summary).await?;
        println!(
            "\n{} Run saved to history (ID: {})",
            INFO,
            style(&summary.run_id.to_string()[..8]).dim()
        );
    }
    #[cfg(not(feature = "sqlite"))]
    let _ = create_summary(&run);

    if matches!(status, conveyor::RunStatus::Succeeded) {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&workflow.name).bold(),
            style("successfully").green()
        );
        Ok(())
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&workflow.name).bold(),
            format_status(&status)
        );
        std::process::exit(1);
    }
}

#[cfg(feature = "sqlite")]
async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = SqliteRunStore::with_default_path().await?;

    if let Some(run_id_str) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id_str).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => {
                println!("{} Run Details", INFO);
                println!("  ID: {}", style(summary.run_id).cyan());
                println!("  Workflow: {}", style(&summary.workflow).bold());
                println!("  Status: {}", format_status(&summary.status));
                println!(
                    "  Started: {}",
                    style(summary.started_at.to_rfc3339()).dim()
                );
                if let Some(finished) = summary.finished_at {
                    println!("  Finished: {}", style(finished.to_rfc3339()).dim());
                    if let Ok(duration) =
                        finished.signed_duration_since(summary.started_at).to_std()
                    {
                        println!("  Duration: {}", style(format_duration(duration)).dim());
                    }
                }
            }
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let runs = match &cmd.workflow {
        Some(workflow) => store.list_runs(workflow).await?,
        None => {
            let mut all = Vec::new();
            for workflow in store.list_workflows().await? {
                all.extend(store.list_runs(&workflow).await?);
            }
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all
        }
    };
    let runs: Vec<_> = runs.into_iter().take(cmd.limit).collect();

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }

    Ok(())
}

#[cfg(not(feature = "sqlite"))]
async fn show_history(_cmd: &HistoryCommand) -> Result<()> {
    anyhow::bail!("run history requires the 'sqlite' feature")
}
