// crates/wfcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wfcore::{
    ExecutionMode, MemoryBus, MemoryTaskStore, WorkflowEvent, WorkflowState, WorkflowSubmission,
};
use wfruntime::{RuntimeConfig, WorkflowRuntime};
use wfworker::{register_all, spawn_workers, HandlerRegistry, WorkerConfig, WorkerExecutor};

#[derive(Parser)]
#[command(name = "wf")]
#[command(about = "Workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file against an in-process engine and workers
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Number of in-process workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout: u64,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available task types
    Handlers,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            workers,
            timeout,
            verbose,
        } => {
            init_tracing(verbose);
            run_workflow(file, workers, Duration::from_secs(timeout)).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Handlers => {
            list_handlers();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn load_submission(file: &PathBuf) -> Result<WorkflowSubmission> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("could not read {}", file.display()))?;
    serde_json::from_str(&json).with_context(|| format!("{} is not a workflow", file.display()))
}

fn handler_registry(config: &WorkerConfig) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_all(&mut registry, config);
    registry
}

async fn run_workflow(file: PathBuf, workers: Option<usize>, timeout: Duration) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let submission = load_submission(&file)?;
    println!("📋 Workflow: {}", submission.name);
    println!("   Tasks: {}", submission.tasks.len());
    println!("   Mode: {:?}", submission.mode());
    println!();

    let runtime_config = RuntimeConfig::from_env();
    let mut worker_config = WorkerConfig::from_env(&runtime_config);
    if let Some(workers) = workers {
        worker_config.workers = workers;
    }
    worker_config.workers = worker_config.workers.max(1);

    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryTaskStore::new());
    let runtime = WorkflowRuntime::new(store.clone(), bus.clone(), runtime_config);

    let shutdown = CancellationToken::new();
    let completion_loop = runtime.spawn_completion_loop(shutdown.clone()).await?;
    let executor = Arc::new(WorkerExecutor::new(
        Arc::new(handler_registry(&worker_config)),
        store,
        bus,
        worker_config,
    ));
    let worker_handles = spawn_workers(executor, shutdown.clone());

    // Subscribe before submitting so no event is missed
    let mut events = runtime.subscribe_events();
    let workflow = runtime.submit(submission).await?;
    let workflow_id = workflow.id.clone();

    let watched = tokio::time::timeout(timeout, async {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if event.workflow_id() != workflow_id {
                continue;
            }
            match &event {
                WorkflowEvent::WorkflowRegistered { task_count, .. } => {
                    println!("▶️  Workflow registered with {} tasks", task_count);
                }
                WorkflowEvent::TaskDispatched {
                    task_id, task_type, ..
                } => {
                    println!("  ⚡ Dispatched task: {} ({})", task_id, task_type);
                }
                WorkflowEvent::DispatchFailed { task_id, error, .. } => {
                    println!("  ⚠️  Could not dispatch {}: {}", task_id, error);
                }
                WorkflowEvent::TaskCompleted { task_id, .. } => {
                    println!("  ✅ Task {} completed", task_id);
                }
                WorkflowEvent::TaskFailed { task_id, .. } => {
                    println!("  ❌ Task {} failed", task_id);
                }
                WorkflowEvent::WorkflowSucceeded { .. } => {
                    println!("✨ Workflow completed successfully");
                }
                WorkflowEvent::WorkflowFailed { failed_task, .. } => {
                    println!("💥 Workflow failed at task {}", failed_task);
                }
            }
            if event.is_terminal() {
                break;
            }
        }
    })
    .await;

    shutdown.cancel();
    let _ = completion_loop.await;
    for handle in worker_handles {
        let _ = handle.await;
    }

    if watched.is_err() {
        anyhow::bail!("workflow {} did not finish within {:?}", workflow_id, timeout);
    }

    let workflow = runtime.get_workflow(&workflow_id).await?;
    println!();
    println!("📊 Execution Summary:");
    println!("   Workflow ID: {}", workflow.id);
    for task in &workflow.tasks {
        println!("   {} {} {}", task.id, task.task_type, task.status);
    }

    match workflow.state {
        WorkflowState::Succeeded => Ok(()),
        WorkflowState::Failed { failed_task } => {
            anyhow::bail!("workflow {} failed at task {}", workflow.id, failed_task)
        }
        other => anyhow::bail!("workflow {} stopped in state {:?}", workflow.id, other),
    }
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_submission(&file)?.into_workflow()?;
    let handlers = handler_registry(&WorkerConfig::default());

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Mode: {:?}", workflow.execution_mode);
    println!("   Tasks: {}", workflow.tasks.len());

    for task in &workflow.tasks {
        if handlers.get(&task.task_type).is_none() {
            println!(
                "   ⚠️  No built-in handler for task type '{}'; it needs an external worker",
                task.task_type
            );
        }
    }

    Ok(())
}

fn list_handlers() {
    println!("📦 Available Task Types:");
    println!();

    let registry = handler_registry(&WorkerConfig::default());
    for task_type in registry.list_task_types() {
        println!("  • {}", task_type);
        if let Some(description) = registry.description(&task_type) {
            println!("    {}", description);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let submission = WorkflowSubmission::new("Example workflow")
        .with_task("debug.log")
        .with_task("time.delay")
        .with_task("debug.log")
        .with_mode(ExecutionMode::Sequential);

    let json = serde_json::to_string_pretty(&submission)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  wf run --file {}", output.display());

    Ok(())
}
