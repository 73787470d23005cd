//! `graphflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: validate a workflow JSON file.
//! - `run`: execute a workflow and print the outcome.
//! - `resume`: continue a paused run with a payload.
//! - `migrate`: run pending database migrations.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use engine::{
    AnswerStreamResponder, ExecutionResult, ExecutorConfig, RunRequest, RunStatus, TraceTask, Workflow, WorkflowExecutor,
};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "graphflow", about = "Workflow graph execution engine", version)]
struct Cli {
    /// SQLite database holding run history. Use a file database to resume
    /// runs across invocations.
    #[arg(long, global = true, env = "DATABASE_URL", default_value = db::pool::IN_MEMORY_URL)]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Run a workflow, printing its events as JSON lines.
    Run {
        path: PathBuf,
        /// User inputs as a JSON object.
        #[arg(long, default_value = "{}")]
        inputs: String,
        /// Print only the streamed answer text instead of events.
        #[arg(long)]
        stream: bool,
    },
    /// Resume a paused run.
    Resume {
        run_id: Uuid,
        /// Workflow the run was started from.
        #[arg(long)]
        graph: PathBuf,
        /// Resume payload as a JSON object.
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        stream: bool,
    },
    /// Run pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let workflow = load_workflow(&path)?;
            match engine::validate_dag(&workflow.graph) {
                Ok(graph) => println!("Workflow is valid. Execution order: {:?}", graph.topo_order()),
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run { path, inputs, stream } => {
            let workflow = load_workflow(&path)?;
            let inputs = parse_object(&inputs).context("--inputs")?;
            let (executor, traces) = connect(&cli.database_url).await?;
            let printer = spawn_printer(&executor, stream);

            let result = executor.run(&workflow, RunRequest::new(inputs)).await?;
            finish(result, printer, executor, traces).await?;
        }
        Command::Resume { run_id, graph, payload, stream } => {
            let workflow = load_workflow(&graph)?;
            let payload = payload.as_deref().map(parse_object).transpose().context("--payload")?;
            let (executor, traces) = connect(&cli.database_url).await?;
            let printer = spawn_printer(&executor, stream);

            let result = executor.resume(&workflow, run_id, payload).await?;
            finish(result, printer, executor, traces).await?;
        }
        Command::Migrate => {
            info!("Running migrations against {}", cli.database_url);
            let pool = db::pool::create_pool(&cli.database_url, 2).await?;
            db::pool::run_migrations(&pool).await?;
            info!("Migrations applied successfully");
        }
    }
    Ok(())
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

fn parse_object(raw: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {other}"),
    }
}

async fn connect(database_url: &str) -> anyhow::Result<(WorkflowExecutor, JoinHandle<()>)> {
    let pool = db::pool::create_pool(database_url, 5).await?;
    db::pool::run_migrations(&pool).await?;

    let (trace_tx, mut trace_rx) = mpsc::channel::<TraceTask>(16);
    let traces = tokio::spawn(async move {
        while let Some(task) = trace_rx.recv().await {
            let run = &task.execution;
            info!(
                run_id = %run.id,
                status = %run.status,
                total_tokens = run.total_tokens,
                total_steps = run.total_steps,
                "Trace recorded"
            );
        }
    });

    let executor = WorkflowExecutor::new(pool, ExecutorConfig::from_env()).with_trace_queue(trace_tx);
    Ok((executor, traces))
}

/// Prints events as JSON lines, or only the answer text when `answer_only`.
fn spawn_printer(executor: &WorkflowExecutor, answer_only: bool) -> JoinHandle<()> {
    let mut events = executor.subscribe();
    tokio::spawn(async move {
        let mut responder = AnswerStreamResponder::new();
        while let Some(event) = events.recv().await {
            if answer_only {
                for output in responder.handle(&event) {
                    print!("{}", output.chunk);
                }
            } else {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(event = event.name(), error = %e, "Cannot serialise event"),
                }
            }
            if event.is_run_terminal() {
                break;
            }
        }
        if answer_only {
            println!();
        }
        if events.dropped() > 0 {
            warn!(dropped = events.dropped(), "Printer fell behind, some events were not printed");
        }
    })
}

async fn finish(
    result: ExecutionResult,
    printer: JoinHandle<()>,
    executor: WorkflowExecutor,
    traces: JoinHandle<()>,
) -> anyhow::Result<()> {
    printer.await?;
    // Dropping the executor closes the trace queue.
    drop(executor);
    traces.await?;

    let outcome = &result.outcome;
    let summary = json!({
        "run_id": result.execution_id,
        "status": outcome.status,
        "outputs": outcome.outputs,
        "error": outcome.error,
        "exceptions_count": outcome.exceptions_count,
        "total_tokens": outcome.total_tokens,
        "steps": outcome.steps,
        "paused_node_ids": outcome.paused_node_ids,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if matches!(outcome.status, RunStatus::Failed | RunStatus::Stopped) {
        std::process::exit(1);
    }
    Ok(())
}

