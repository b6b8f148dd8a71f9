//! Agent Fleet command-line runner
//!
//! Runs a workflow against a simulated fleet:
//! - `run`: register a fleet and a workflow, execute it and print the result
//! - `validate`: check a workflow definition without running it

mod simulated;

use agent_fleet_core::config::FleetConfig;
use agent_fleet_core::instance::InstanceSpec;
use agent_fleet_core::workflow::WorkflowDefinition;
use agent_fleet_runtime::{FleetCollaborators, FleetManager};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use simulated::SimulatedInvoker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Agent fleet manager and workflow runner
#[derive(Parser)]
#[command(name = "agent-fleet")]
#[command(version)]
struct Cli {
    /// Log level applied to the fleet crates when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info", env = "AGENT_FLEET_LOG_LEVEL")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow against a simulated fleet
    Run {
        /// Fleet configuration file (TOML, JSON or YAML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON array of instance specs to register
        #[arg(long)]
        fleet: PathBuf,

        /// JSON workflow definition
        #[arg(long)]
        workflow: PathBuf,

        /// Execution input as inline JSON
        #[arg(long, default_value = "{}")]
        input: String,

        /// Simulated agent latency in milliseconds
        #[arg(long, default_value_t = 100)]
        latency_ms: u64,

        /// Fraction of simulated calls that fail, 0.0-1.0
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,
    },
    /// Validate a workflow definition
    Validate {
        #[arg(long)]
        workflow: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    match cli.command {
        Command::Run {
            config,
            fleet,
            workflow,
            input,
            latency_ms,
            failure_rate,
        } => {
            let input: Value =
                serde_json::from_str(&input).context("--input is not valid JSON")?;
            let invoker = SimulatedInvoker::new(Duration::from_millis(latency_ms), failure_rate);
            let report = run(config.as_deref(), &fleet, &workflow, input, invoker)
                .await
                .map_err(|e| {
                    error!("Run failed: {:#}", e);
                    e
                })?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Validate { workflow } => {
            let definition = load_workflow(&workflow)?;
            info!(
                "Workflow '{}' is valid ({} steps)",
                definition.name,
                definition.steps.len()
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "valid": true,
                    "name": definition.name,
                    "steps": definition.steps.len(),
                }))?
            );
        }
    }

    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let directives = format!(
        "agent_fleet_core={level},agent_fleet_runtime={level},agent_fleet={level}"
    );
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

async fn run(
    config_path: Option<&Path>,
    fleet_path: &Path,
    workflow_path: &Path,
    input: Value,
    invoker: SimulatedInvoker,
) -> Result<Value> {
    let config = FleetConfig::load(config_path).context("Failed to load configuration")?;
    let fleet: Vec<InstanceSpec> = read_json(fleet_path)?;
    let definition = load_workflow(workflow_path)?;

    let manager = FleetManager::new(config, FleetCollaborators::new(Arc::new(invoker)))?;
    manager.start()?;

    let outcome = execute(&manager, fleet, definition, input).await;
    manager.stop().await;
    outcome
}

/// Register the fleet and workflow on a started manager and run it once
async fn execute(
    manager: &FleetManager,
    fleet: Vec<InstanceSpec>,
    definition: WorkflowDefinition,
    input: Value,
) -> Result<Value> {
    for spec in fleet {
        manager.register_agent_instance(spec)?;
    }
    let workflow_id = manager.register_workflow(definition)?;
    info!(
        "Registered {} instances, executing workflow {}",
        manager.list_instances().len(),
        workflow_id
    );

    let execution = manager
        .execute_workflow(workflow_id, input)?
        .wait()
        .await?;
    Ok(json!({
        "execution": execution,
        "fleet_status": manager.get_fleet_status(),
    }))
}

fn load_workflow(path: &Path) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = read_json(path)?;
    definition
        .validate()
        .with_context(|| format!("Invalid workflow definition in {}", path.display()))?;
    Ok(definition)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}
