//! `workflow-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — validate a task graph JSON file and print its execution order.
//! - `plan`     — print the runnable snapshot a run of the graph would start from.
//! - `run`      — execute the graph in-process with the built-in executors.

mod logging;
mod workflow_file;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use db::MemoryStore;
use engine::{materialize, validate_task_graph, RunId, RunStore, SchedulerConfig, WorkflowScheduler};
use queue::{ExecutorRegistry, WorkerPool, WorkerPoolConfig};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use worker::{EchoExecutor, ShellExecutor};

#[derive(Parser)]
#[command(
    name = "workflow-engine",
    about = "Distributed workflow DAG engine",
    version
)]
struct Cli {
    /// Log filter, e.g. `debug` or `engine=debug,queue=info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct RunInputs {
    /// Path to the task graph JSON file.
    path: PathBuf,

    /// JSON file with run parameters (`runWide`, `perTask`).
    #[arg(long)]
    parameters: Option<PathBuf>,

    /// Parameter override: `KEY=VALUE` for the whole run, `TASK:KEY=VALUE`
    /// for one task. Repeatable.
    #[arg(long = "param", short = 'p')]
    params: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a task graph JSON file.
    Validate {
        /// Path to the task graph JSON file.
        path: PathBuf,
    },
    /// Print the materialized run for a task graph.
    Plan {
        #[command(flatten)]
        inputs: RunInputs,
    },
    /// Run a task graph to completion.
    Run {
        #[command(flatten)]
        inputs: RunInputs,

        /// Run id; a random one is generated if omitted.
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long, env = "WORKFLOW_INSTANCE_ID", default_value = "workflow-engine")]
        instance_id: String,

        /// Number of concurrent workers.
        #[arg(long, env = "WORKFLOW_WORKERS", default_value_t = 4)]
        workers: usize,

        /// Retries for retryable worker errors.
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        #[arg(long, default_value_t = 30_000)]
        lock_ttl_ms: u64,

        #[arg(long, default_value_t = 200)]
        poll_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level.as_deref())?;

    match cli.command {
        Command::Validate { path } => {
            let root = workflow_file::load_task(&path)?;
            match validate_task_graph(&root) {
                Ok(order) => {
                    let order: Vec<&str> = order.iter().map(|id| id.as_str()).collect();
                    println!("✅ Task graph is valid. Execution order: {order:?}");
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }

        Command::Plan { inputs } => {
            let root = workflow_file::load_task(&inputs.path)?;
            let parameters = workflow_file::load_parameters(inputs.parameters.as_deref(), &inputs.params)?;
            let runnable = materialize(&RunId::from("plan"), &root, &parameters)?;
            println!("{}", serde_json::to_string_pretty(&runnable)?);
        }

        Command::Run {
            inputs,
            run_id,
            instance_id,
            workers,
            max_retries,
            lock_ttl_ms,
            poll_interval_ms,
        } => {
            let scheduler_config = SchedulerConfig {
                instance_id,
                lock_ttl: Duration::from_millis(lock_ttl_ms),
                poll_interval: Duration::from_millis(poll_interval_ms),
                purge_completed_runs: false,
            };
            let pool_config = WorkerPoolConfig {
                workers,
                max_retries,
                ..WorkerPoolConfig::default()
            };
            let run_id = run_id.map(RunId::from).unwrap_or_else(RunId::random);
            run(inputs, run_id, scheduler_config, pool_config).await?;
        }
    }

    Ok(())
}

/// Run one graph on an in-process store, worker pool and scheduler.
async fn run(
    inputs: RunInputs,
    run_id: RunId,
    scheduler_config: SchedulerConfig,
    pool_config: WorkerPoolConfig,
) -> Result<()> {
    let root = workflow_file::load_task(&inputs.path)?;
    let parameters = workflow_file::load_parameters(inputs.parameters.as_deref(), &inputs.params)?;

    let memory = Arc::new(MemoryStore::new());
    let store = RunStore::new(memory.clone());
    let registry = ExecutorRegistry::new()
        .register("shell", Arc::new(ShellExecutor::default()))
        .with_fallback(Arc::new(EchoExecutor));
    let pool = Arc::new(WorkerPool::start(pool_config, registry, store.clone()));
    let poll_interval = scheduler_config.poll_interval;
    let scheduler = Arc::new(WorkflowScheduler::new(store.clone(), pool.clone(), scheduler_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let leader = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(shutdown_rx).await }
    });

    scheduler
        .submit_with_id(run_id.clone(), &root, &parameters)
        .await
        .context("failed to submit run")?;
    info!(run_id = %run_id, "run started");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("interrupted; cancelling run");
                scheduler.cancel_run(&run_id).await?;
                break;
            }
            _ = ticker.tick() => {
                let (runnable, _) = store.load_run(&run_id).await?;
                if runnable.is_complete() {
                    break;
                }
            }
        }
    }

    let report = scheduler.report(&run_id).await?;

    let _ = shutdown_tx.send(true);
    leader.await.context("scheduler task panicked")??;
    pool.shutdown().await?;
    debug!(keys = memory.len().await, "store contents at exit");

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_success() {
        bail!("run {run_id} finished as {:?}", report.outcome);
    }
    Ok(())
}
