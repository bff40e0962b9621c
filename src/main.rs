use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nodeflow_core::config::AppConfig;
use nodeflow_core::traits::WorkflowStore;
use nodeflow_core::types::{Caller, Profile, RunId, RunStatus, Workflow};
use nodeflow_engine::{DryRunDriverFactory, ExecuteOptions, Executor};
use nodeflow_nodes::NodeRegistry;
use nodeflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "nodeflow", version, about = "Graph-based workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "nodeflow.toml")]
    config: PathBuf,

    /// Role of the caller, checked against the capability policy
    #[arg(long, env = "NODEFLOW_ROLE", default_value = "staff")]
    role: String,

    /// Caller id recorded in audit events
    #[arg(long, env = "NODEFLOW_CALLER", default_value = "cli")]
    caller: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow from a JSON file or the store
    Run {
        /// Workflow file, or the id of an imported workflow
        workflow: String,
        /// Profile JSON file ({"id": ..., "data": {...}})
        #[arg(long)]
        profile: Option<PathBuf>,
        /// Initial run variable (NAME=VALUE, VALUE parsed as JSON when possible)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
        /// Echo driver actions instead of performing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Save a workflow file into the store
    Import {
        file: PathBuf,
        /// Override the workflow id
        #[arg(long)]
        id: Option<String>,
        /// Override the workflow name
        #[arg(long)]
        name: Option<String>,
    },
    /// List stored workflows
    List,
    /// Remove a stored workflow and its run history
    Remove { id: String },
    /// Show the node catalog
    Catalog {
        /// Only nodes this role may run
        #[arg(long)]
        role: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show recent runs of a workflow
    History {
        workflow_id: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// A workflow file holds either a full workflow or a bare graph.
#[derive(Deserialize)]
#[serde(untagged)]
enum WorkflowFile {
    Full {
        id: Option<String>,
        name: Option<String>,
        graph: Value,
    },
    Graph(Value),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nodeflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "nodeflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        let home_config = dirs_home().map(|h| h.join(".nodeflow").join("config.toml"));
        match home_config {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading config from home directory");
                AppConfig::load(&path)?
            }
            _ => AppConfig::default(),
        }
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Catalog { role, json } => {
            let registry = NodeRegistry::with_builtins();
            let entries = registry.catalog(role.as_deref().map(|r| (&config.policy, r)));
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!(
                        "  {:<18} {:<12} {:<9} {}",
                        entry.id,
                        entry.category.to_string(),
                        entry.risk.to_string(),
                        entry.capabilities.join(", ")
                    );
                }
            }
        }
        Commands::Import { file, id, name } => {
            let store = open_store(&config)?;
            let mut workflow = load_workflow_file(&file)?;
            if let Some(id) = id {
                workflow.id = id;
            }
            if let Some(name) = name {
                workflow.name = name;
            }
            // Reject graphs the engine could never run
            nodeflow_engine::ParsedGraph::parse(&workflow.graph)?.start_node()?;
            store.save_workflow(&workflow).await?;
            println!("Imported workflow '{}' ({})", workflow.id, workflow.name);
        }
        Commands::List => {
            let store = open_store(&config)?;
            let workflows = store.list_workflows()?;
            if workflows.is_empty() {
                println!("  No workflows imported yet.");
            }
            for wf in workflows {
                println!(
                    "  {:<24} {:<32} {}",
                    wf.id,
                    wf.name,
                    wf.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Remove { id } => {
            let store = open_store(&config)?;
            if store.delete_workflow(&id)? {
                println!("Removed workflow '{}'", id);
            } else {
                anyhow::bail!("no stored workflow '{}'", id);
            }
        }
        Commands::History { workflow_id, limit } => {
            let store = open_store(&config)?;
            let runs = store.list_runs(&workflow_id, limit).await?;
            if runs.is_empty() {
                println!("  No runs recorded for '{}'.", workflow_id);
            }
            for run in runs {
                println!(
                    "  {:<38} {:<10} {:>7}ms  {} nodes{}",
                    run.run_id.as_str(),
                    run.status.to_string(),
                    run.duration_ms,
                    run.executed_nodes.len(),
                    run.error.map(|e| format!("  ({})", e)).unwrap_or_default()
                );
            }
        }
        Commands::Run {
            workflow,
            profile,
            vars,
            dry_run,
        } => {
            let store = open_store(&config)?;
            let path = Path::new(&workflow);
            let workflow = if path.exists() {
                load_workflow_file(path)?
            } else {
                store
                    .load_workflow(&workflow)
                    .await?
                    .with_context(|| format!("'{}' is neither a file nor a stored workflow", workflow))?
            };

            let mut profile = match profile {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading profile {}", path.display()))?;
                    Some(serde_json::from_str::<Profile>(&text)?)
                }
                None => None,
            };

            let mut executor = Executor::from_config(&config);
            if dry_run {
                executor = executor.with_driver_factory(Arc::new(DryRunDriverFactory));
                profile.get_or_insert_with(|| Profile::new("dry-run"));
            }
            let executor = Arc::new(executor);

            let run_id = RunId::new();
            let mut options = ExecuteOptions::new(Caller::new(cli.caller, cli.role))
                .with_run_id(run_id.clone())
                .with_variables(parse_vars(&vars)?);
            if let Some(profile) = profile {
                options = options.with_profile(profile);
            }

            let cancel = executor.clone();
            let cancel_id = run_id.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                warn!(run_id = %cancel_id, "Interrupted, cancelling run");
                cancel.cancel_run(&cancel_id).await;
            });

            let summary = executor.execute(&workflow, options).await?;
            if let Err(e) = store.record_run(&summary).await {
                warn!(run_id = %summary.run_id, error = %e, "Failed to record run");
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if summary.status == RunStatus::Error {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn open_store(config: &AppConfig) -> anyhow::Result<SqliteStore> {
    let path = config.store_path();
    SqliteStore::open(&path).with_context(|| format!("opening store at {}", path.display()))
}

fn load_workflow_file(path: &Path) -> anyhow::Result<Workflow> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());

    let workflow = match serde_json::from_str::<WorkflowFile>(&text)? {
        WorkflowFile::Full { id, name, graph } => {
            let id = id.unwrap_or_else(|| stem.clone());
            let name = name.unwrap_or_else(|| id.clone());
            Workflow::new(id, name, graph)
        }
        WorkflowFile::Graph(graph) => Workflow::new(stem.clone(), stem, graph),
    };
    Ok(workflow)
}

fn parse_vars(vars: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut out = Map::new();
    for var in vars {
        let (name, raw) = var
            .split_once('=')
            .with_context(|| format!("expected NAME=VALUE, got '{}'", var))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        out.insert(name.trim().to_string(), value);
    }
    Ok(out)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
