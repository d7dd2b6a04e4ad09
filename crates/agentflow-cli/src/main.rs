// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Agentflow CLI.

use agentflow_core::{
    load_workflow_from_file, AgentError, AgentService, EngineConfig, ExecStatus, Execution,
    WorkflowDag, WorkflowEngine,
};
use agentflow_state::FileStateStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(version, about = "Multi-agent workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition
    Validate {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Run a workflow against the built-in simulator agents
    Run {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Input JSON string or file
        #[arg(short, long)]
        input: Option<String>,

        /// Directory for execution state snapshots
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Inspect persisted executions
    Inspect {
        /// Directory holding execution state snapshots
        #[arg(long)]
        state_dir: PathBuf,

        /// Execution id to show in detail; omitted, lists all executions
        #[arg(value_name = "EXECUTION_ID")]
        execution_id: Option<String>,

        /// Only list executions of this workflow
        #[arg(short, long)]
        workflow: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agentflow={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run {
            file,
            input,
            state_dir,
        } => run_workflow(&file, input.as_deref(), state_dir).await,
        Commands::Inspect {
            state_dir,
            execution_id,
            workflow,
        } => inspect_executions(state_dir, execution_id.as_deref(), workflow.as_deref()).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("{} {}", "Validating workflow:".cyan().bold(), file.display());

    let workflow = load_workflow_from_file(file)
        .with_context(|| format!("Failed to load workflow file: {}", file.display()))?;

    workflow
        .validate()
        .with_context(|| "Workflow validation failed")?;

    let dag = WorkflowDag::from_workflow(&workflow)
        .with_context(|| "Failed to resolve workflow dependencies")?;

    println!("{}", "✓ Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    println!("  Discipline: {:?}", workflow.discipline);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Order: {}", dag.execution_order().join(" -> "));

    Ok(())
}

async fn run_workflow(file: &Path, input: Option<&str>, state_dir: Option<PathBuf>) -> Result<()> {
    println!("{} {}", "Running workflow:".cyan().bold(), file.display());

    let workflow = load_workflow_from_file(file)
        .with_context(|| format!("Failed to load workflow file: {}", file.display()))?;
    let budget = workflow.settings.max_execution_time_seconds;

    let inputs = match input {
        Some(input) => parse_input(input)?,
        None => HashMap::new(),
    };

    let mut engine = WorkflowEngine::with_config(
        Arc::new(SimulatorAgentService),
        EngineConfig::default(),
    );
    if let Some(dir) = state_dir {
        info!(dir = %dir.display(), "Persisting execution state");
        engine = engine.with_state_store(Arc::new(FileStateStore::new(dir)));
    }
    engine.start().await;

    let workflow_id = engine
        .create_workflow(workflow)
        .with_context(|| "Workflow validation failed")?;
    let execution_id = engine
        .execute_workflow(&workflow_id, inputs)
        .with_context(|| "Failed to queue execution")?;

    println!("{} {}", "Execution:".cyan(), execution_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(budget + 10);
    let final_state = loop {
        if let Some(state) = engine.get_execution_status(&execution_id) {
            if state.status.is_terminal() {
                break state;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("Execution did not settle within the wall-time budget");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    engine.stop().await;

    match final_state.status {
        ExecStatus::Completed => {
            println!("{}", "✓ Workflow completed successfully".green().bold());
        }
        status => {
            println!(
                "{} {:?}: {}",
                "✗ Workflow finished".red().bold(),
                status,
                final_state.error_message
            );
        }
    }

    println!("\n{}", "Step outputs:".cyan().bold());
    println!(
        "{}",
        serde_json::to_string_pretty(&final_state.step_outputs)
            .unwrap_or_else(|_| format!("{:?}", final_state.step_outputs))
    );

    Ok(())
}

/// Loads the snapshot store into a fresh engine and queries it.
async fn inspect_executions(
    state_dir: PathBuf,
    execution_id: Option<&str>,
    workflow_id: Option<&str>,
) -> Result<()> {
    let engine = WorkflowEngine::new(Arc::new(SimulatorAgentService))
        .with_state_store(Arc::new(FileStateStore::new(state_dir)));
    engine.start().await;

    let result = match execution_id {
        Some(execution_id) => show_execution(&engine, execution_id),
        None => list_executions(&engine, workflow_id),
    };

    engine.stop().await;
    result
}

fn show_execution(engine: &WorkflowEngine, execution_id: &str) -> Result<()> {
    let execution = engine
        .get_execution_status(execution_id)
        .with_context(|| format!("Execution not found: {}", execution_id))?;

    println!("{} {}", "Execution:".cyan().bold(), execution.execution_id);
    println!("  Workflow: {}", execution.workflow_id);
    println!("  Status: {}", execution.status.as_str());
    println!("  Progress: {:.0}%", execution.progress_percentage);
    if let Some(ms) = execution.duration_ms() {
        println!("  Duration: {}ms", ms);
    }
    if !execution.error_message.is_empty() {
        println!("  Error: {}", execution.error_message.red());
    }

    if let Some(globals) = engine.get_global_context(execution_id) {
        if !globals.is_empty() {
            println!("\n{}", "Global context:".cyan().bold());
            println!(
                "{}",
                serde_json::to_string_pretty(&globals).unwrap_or_else(|_| format!("{:?}", globals))
            );
        }
    }

    println!("\n{}", "Steps:".cyan().bold());
    let mut step_ids: Vec<&String> = execution.step_states.keys().collect();
    step_ids.sort();
    for step_id in step_ids {
        let state = &execution.step_states[step_id];
        println!(
            "  {} [{}] retries={}",
            step_id.bold(),
            state.status.as_str(),
            state.retry_count
        );
        if let Some(output) = engine.get_step_output(execution_id, step_id) {
            println!("    output: {}", output);
        }
        if let Some(error) = &state.error_message {
            println!("    error: {}", error.red());
        }
    }

    Ok(())
}

fn list_executions(engine: &WorkflowEngine, workflow_id: Option<&str>) -> Result<()> {
    let mut entries: Vec<Execution> = engine
        .get_active_executions()
        .into_iter()
        .filter(|e| workflow_id.map(|id| e.workflow_id == id).unwrap_or(true))
        .collect();
    entries.extend(engine.get_execution_history(workflow_id));

    if entries.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!("{}", "Executions:".cyan().bold());
    for entry in entries {
        println!(
            "  {} workflow={} status={} progress={:.0}%",
            entry.execution_id.bold(),
            entry.workflow_id,
            entry.status.as_str(),
            entry.progress_percentage
        );
    }
    Ok(())
}

fn parse_input(input: &str) -> Result<HashMap<String, Value>> {
    // A path on disk wins; otherwise the argument is inline JSON.
    if Path::new(input).exists() {
        let content = std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read input file: {}", input))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse input JSON from file: {}", input))
    } else {
        serde_json::from_str(input).with_context(|| "Failed to parse input JSON string")
    }
}

/// Offline agent service: every function call echoes its invocation so
/// workflows can be exercised without a live agent runtime.
struct SimulatorAgentService;

#[async_trait]
impl AgentService for SimulatorAgentService {
    async fn execute(
        &self,
        agent_id: &str,
        function_name: &str,
        params: Value,
        _deadline: Duration,
    ) -> Result<Value, AgentError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(serde_json::json!({
            "agent": agent_id,
            "function": function_name,
            "params": params,
            "simulated": true,
        }))
    }
}
