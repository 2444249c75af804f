use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use weave_agent::{AgentRegistry, DryRunAgent, ExecutionStore, LifecycleTracker, WorkflowExecutor};
use weave_core::config::{AppConfig, ExecutorConfig};
use weave_core::event::{EventBus, EventFilter, TaskEvent};
use weave_core::traits::{Agent, AgentDirectory};
use weave_core::types::{AgentInfo, ValueMap};
use weave_workflow::{parser, Dag, Workflow};

#[derive(Parser)]
#[command(name = "weave", version, about = "Dependency-ordered workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition without running it
    Validate {
        /// Workflow file (.json or .toml)
        file: PathBuf,
    },
    /// Show the execution order and parallel levels of a workflow
    Plan {
        file: PathBuf,
    },
    /// Run a workflow against the configured agents
    Run {
        file: PathBuf,
        /// Workflow input as key=value (value parsed as JSON when possible)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Run each level's steps concurrently
        #[arg(long)]
        parallel: bool,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    if !cli.config.exists() {
        debug!(path = %cli.config.display(), "No config file, using defaults");
    }

    match cli.command {
        Commands::Validate { file } => {
            let workflow = load_workflow(&file)?;
            let dag = Dag::build(&workflow.steps)?;
            println!(
                "{} is valid: {} steps in {} levels",
                workflow.name,
                dag.len(),
                dag.levels().len()
            );
        }
        Commands::Plan { file } => {
            let workflow = load_workflow(&file)?;
            let dag = Dag::build(&workflow.steps)?;
            println!("Workflow: {} (v{})", workflow.name, workflow.version);
            println!();
            print!("{dag}");
            println!();
            for (i, level) in dag.levels().iter().enumerate() {
                println!("Level {}: {}", i + 1, level.join(", "));
            }
        }
        Commands::Run {
            file,
            inputs,
            parallel,
        } => {
            let workflow = load_workflow(&file)?;
            let inputs = parse_inputs(&inputs)?;
            let executor = executor_config(&config, parallel);
            run_workflow(&config, executor, &workflow, inputs).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let workflow = parser::from_file(path)
        .with_context(|| format!("failed to load workflow {}", path.display()))?;
    parser::validate(&workflow)?;
    Ok(workflow)
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<ValueMap> {
    let mut inputs = ValueMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("input must be KEY=VALUE, got {pair:?}");
        };
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        inputs.insert(key.trim().to_string(), value);
    }
    Ok(inputs)
}

/// `--parallel` wins over both the config file and the workflow definition.
fn executor_config(config: &AppConfig, parallel: bool) -> ExecutorConfig {
    let mut executor = config.executor.clone();
    if parallel {
        executor.parallel_execution = Some(true);
    }
    executor
}

/// Build the directory from config and the workflow's own agent list.
///
/// Every agent is a dry-run agent; declared workflow agents missing from the
/// config are added with the capabilities the workflow gives them.
fn build_directory(config: &AppConfig, workflow: &Workflow) -> anyhow::Result<Arc<AgentRegistry>> {
    let registry = Arc::new(AgentRegistry::new());
    registry.register_entries(&config.agents, |entry| {
        Arc::new(DryRunAgent::new(&entry.name)) as Arc<dyn Agent>
    })?;

    for declared in &workflow.agents {
        if registry.get(&declared.name).is_ok() {
            continue;
        }
        let info = AgentInfo::new(&declared.name, &declared.kind)
            .with_capabilities(declared.capabilities.iter().cloned());
        registry.register_agent(info, Arc::new(DryRunAgent::new(&declared.name)))?;
    }

    if registry.is_empty() {
        warn!("No agents configured; adding a default dry-run agent");
        registry.register_agent(
            AgentInfo::new("default", "worker"),
            Arc::new(DryRunAgent::new("default")),
        )?;
    }
    Ok(registry)
}

async fn run_workflow(
    config: &AppConfig,
    executor_config: ExecutorConfig,
    workflow: &Workflow,
    inputs: ValueMap,
) -> anyhow::Result<()> {
    let directory = build_directory(config, workflow)?;
    let bus = Arc::new(EventBus::from_config(&config.events));
    let lifecycle = Arc::new(LifecycleTracker::new(bus.clone()));
    let store = Arc::new(ExecutionStore::new());
    let executor = WorkflowExecutor::new(directory, lifecycle)
        .with_store(store)
        .with_config(executor_config);

    let events = bus.subscribe_with(EventFilter::all(), |event: TaskEvent| async move {
        debug!(event = %event.name, task_id = %event.task_id, "Lifecycle event");
        Ok(())
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling workflow");
            ctrl_c.cancel();
        }
    });

    let execution = executor.execute(workflow, inputs, cancel).await?;
    events.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&execution)?);
    execution.into_result()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_flag_overrides_config() {
        let mut config = AppConfig::default();
        config.executor.parallel_execution = Some(false);
        assert_eq!(executor_config(&config, true).parallel_execution, Some(true));
        assert_eq!(executor_config(&config, false).parallel_execution, Some(false));

        let config = AppConfig::default();
        assert_eq!(executor_config(&config, false).parallel_execution, None);
    }

    #[test]
    fn test_parse_inputs() {
        let inputs = parse_inputs(&["n=3".into(), "city=Oslo".into(), "flags=[1,2]".into()]).unwrap();
        assert_eq!(inputs["n"], 3);
        assert_eq!(inputs["city"], "Oslo");
        assert_eq!(inputs["flags"], serde_json::json!([1, 2]));
        assert!(parse_inputs(&["missing".into()]).is_err());
    }
}
