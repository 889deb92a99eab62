use anyhow::{Context, Result};
use stagerun::agent::CommandAgent;
use stagerun::cli::commands::{RunCommand, ValidateCommand};
use stagerun::cli::output::*;
use stagerun::cli::{Cli, Command};
use stagerun::core::config::PipelineConfig;
use stagerun::core::PipelineStatus;
use stagerun::execution::{graph, AbortController, ExecutionEngine};
use std::time::Duration;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, cli.stream).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand, stream: bool) -> Result<()> {
    // Load pipeline config
    let config = PipelineConfig::from_file(&cmd.file)
        .with_context(|| format!("Failed to load pipeline config from {}", cmd.file))?;

    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let mut pipeline = config.to_pipeline();

    // Apply variable overrides
    for (key, value) in &cmd.variable {
        pipeline.variables.insert(key.clone(), value.clone());
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    if let Some(strategy) = cmd.scheduling_strategy() {
        pipeline.strategy = strategy;
    }

    let abort = AbortController::with_grace_period(Duration::from_secs(cmd.grace_secs));
    let engine = ExecutionEngine::with_abort_controller(CommandAgent::new(config.command_specs()), abort.clone());

    // Set up event handler for console output
    engine.add_event_handler(move |event, _state| {
        if let Some(line) = format_execution_event(event, stream) {
            println!("{}", line);
        }
    });

    // Ctrl-C aborts the run; in-flight processes get the grace period
    let interrupt = abort.clone();
    let interrupt_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{} Interrupted; aborting pipeline", WARN);
            interrupt.abort();
        }
    });

    println!();
    let result = engine.execute(&pipeline).await;
    interrupt_task.abort();

    if abort.is_aborted() {
        abort.wait_for_processes().await;
    }

    let state = result.context("Pipeline could not be started")?;

    println!("\n{}", format_summary(&state));

    // Print final status
    match state.status {
        PipelineStatus::Completed => {
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&pipeline.name).bold(),
                style("successfully").green()
            );
        }
        PipelineStatus::Partial => {
            warn!("Pipeline {} finished with failed stages", pipeline.name);
            println!(
                "\n{} {} completed {}",
                WARN,
                style(&pipeline.name).bold(),
                style("with failures").yellow()
            );
        }
        PipelineStatus::Failed | PipelineStatus::Running => {
            println!(
                "\n{} {} {}",
                CROSS,
                style(&pipeline.name).bold(),
                style("failed").red()
            );
            error!("Pipeline {} failed", pipeline.name);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let config = match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => config,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    };

    let stages = config.stage_definitions();
    let graph = graph::build(&stages);

    println!("{} Pipeline configuration is valid!", CHECK);
    println!("  Name: {}", style(&config.name).bold());
    println!("  Stages: {}", style(stages.len()).cyan());
    println!("  Variables: {}", style(config.variables.len()).cyan());
    println!("  Groups:");
    println!("{}", format_groups(&graph));

    if cmd.json {
        let groups: Vec<Vec<String>> = graph.groups.iter().map(|g| g.stage_names()).collect();
        let data = serde_json::json!({
            "name": config.name,
            "version": config.version,
            "strategy": config.scheduling_strategy(),
            "groups": groups,
        });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(())
}
