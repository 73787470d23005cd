//! Workflow execution entry points.
//!
//! `WorkflowExecutor` wires a run together:
//! 1. Validates the graph document.
//! 2. Seeds the variable pool and maps user inputs onto the start node.
//! 3. Builds a [`GraphEngine`] with the persistence layer and event bus.
//! 4. Drives it to a terminal or paused state.
//!
//! Resuming a paused run reloads its snapshot from the database.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use db::models::WorkflowExecutionStatus;
use db::DbPool;
use nodes::config::NodeKind;
use nodes::NodeServices;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dag::{validate_dag, Graph};
use crate::events::{EventBus, EventSubscriber};
use crate::graph_engine::{GraphEngine, RunIds, RunOutcome};
use crate::inputs::{start_mappings, FileResolver, InputMapper, StaticFileResolver};
use crate::persistence::{PersistenceLayer, TraceTask, WorkflowMetadata};
use crate::pool::{SystemVariables, VariablePool};
use crate::snapshot::PauseSnapshot;
use crate::{EngineError, Workflow};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on node bodies running at the same time.
    pub max_concurrent_nodes: usize,
    /// Node attempts allowed per run (retries included).
    pub max_steps: u32,
    /// Capacity of the broadcast event bus.
    pub event_buffer: usize,
    /// Base delay for exponential back-off when a node sets no retry interval.
    pub retry_base_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 8,
            max_steps: 500,
            event_buffer: 256,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `GRAPHFLOW_*` environment variables.
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_nodes: env_or("GRAPHFLOW_MAX_CONCURRENT_NODES", defaults.max_concurrent_nodes),
            max_steps: env_or("GRAPHFLOW_MAX_STEPS", defaults.max_steps),
            event_buffer: env_or("GRAPHFLOW_EVENT_BUFFER", defaults.event_buffer),
            retry_base_delay: Duration::from_millis(env_or(
                "GRAPHFLOW_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparseable configuration value");
            default
        }),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// What the caller supplies for a new run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// User inputs, keyed `node.variable` or by bare variable name.
    pub inputs: Map<String, Value>,
    pub system: SystemVariables,
}

impl RunRequest {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self { inputs, system: SystemVariables::default() }
    }
}

/// A run that is ready to go; grab a handle before calling `run`.
pub struct PreparedRun {
    pub run_id: Uuid,
    pub engine: GraphEngine,
}

/// The result of running (or resuming) a workflow.
#[derive(Debug)]
pub struct ExecutionResult {
    /// ID of the `workflow_executions` row for this run.
    pub execution_id: Uuid,
    pub outcome: RunOutcome,
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Construct one executor per process and call [`WorkflowExecutor::run`]
/// per workflow run.
pub struct WorkflowExecutor {
    pool: DbPool,
    config: ExecutorConfig,
    services: NodeServices,
    file_resolver: Arc<dyn FileResolver>,
    bus: EventBus,
    trace_tx: Option<mpsc::Sender<TraceTask>>,
}

impl WorkflowExecutor {
    pub fn new(pool: DbPool, config: ExecutorConfig) -> Self {
        let bus = EventBus::new(config.event_buffer);
        Self {
            pool,
            config,
            services: NodeServices::default(),
            file_resolver: Arc::new(StaticFileResolver::new()),
            bus,
            trace_tx: None,
        }
    }

    pub fn with_services(mut self, services: NodeServices) -> Self {
        self.services = services;
        self
    }

    pub fn with_file_resolver(mut self, resolver: Arc<dyn FileResolver>) -> Self {
        self.file_resolver = resolver;
        self
    }

    /// Hand finished runs to a telemetry consumer.
    pub fn with_trace_queue(mut self, trace_tx: mpsc::Sender<TraceTask>) -> Self {
        self.trace_tx = Some(trace_tx);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Events of every run started by this executor from now on.
    pub fn subscribe(&self) -> EventSubscriber {
        self.bus.subscribe()
    }

    /// Validate, seed the pool and build the engine without starting it.
    ///
    /// # Errors
    /// Graph validation and input mapping errors. Nothing is persisted
    /// before the engine runs.
    pub fn prepare(&self, workflow: &Workflow, request: RunRequest) -> Result<PreparedRun, EngineError> {
        let graph = validate_dag(&workflow.graph)?;
        let run_id = Uuid::new_v4();

        let mut system = request.system;
        system.workflow_id = Some(workflow.id);
        system.workflow_run_id = Some(run_id);
        let mut pool = VariablePool::new(
            system,
            workflow.environment_variables.clone(),
            workflow.conversation_variables.clone(),
        );

        let root = graph.root_id();
        let mappings = match graph.node(root).map(|n| &n.data.kind) {
            Some(NodeKind::Start(data)) => start_mappings(root, data),
            _ => Vec::new(),
        };
        InputMapper::new(self.file_resolver.as_ref()).map_into(&mappings, &request.inputs, &mut pool)?;

        let ids = RunIds { workflow_id: workflow.id, run_id };
        let engine = GraphEngine::new(graph, pool, ids, self.config.clone(), self.services.clone())
            .with_layer(self.persistence(workflow, run_id))
            .with_bus(self.bus.clone())
            .with_run_inputs(request.inputs);
        Ok(PreparedRun { run_id, engine })
    }

    /// Run the workflow to completion (or pause).
    ///
    /// Node failures do not surface here: they end up in the outcome's
    /// status and in the persisted run.
    #[instrument(skip(self, workflow, request), fields(workflow_id = %workflow.id))]
    pub async fn run(&self, workflow: &Workflow, request: RunRequest) -> Result<ExecutionResult, EngineError> {
        let prepared = self.prepare(workflow, request)?;
        info!(run_id = %prepared.run_id, "Executing workflow '{}'", workflow.name);
        let outcome = prepared.engine.run().await;
        Ok(ExecutionResult { execution_id: prepared.run_id, outcome })
    }

    /// Rebuild a paused run from its stored snapshot.
    ///
    /// # Errors
    /// - [`EngineError::NotPaused`] if the run is not paused.
    /// - [`EngineError::CorruptSnapshot`] if the snapshot cannot be used;
    ///   the stored run is left untouched.
    pub async fn prepare_resume(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        payload: Option<Map<String, Value>>,
    ) -> Result<PreparedRun, EngineError> {
        let row = db::repository::executions::get_workflow_execution(&self.pool, run_id).await?;
        if row.status() != Ok(WorkflowExecutionStatus::Paused) {
            return Err(EngineError::NotPaused(run_id));
        }
        if row.workflow_id != workflow.id {
            return Err(EngineError::CorruptSnapshot(format!(
                "run {run_id} belongs to workflow {}",
                row.workflow_id
            )));
        }
        let raw = row
            .pause_snapshot
            .as_deref()
            .ok_or_else(|| EngineError::CorruptSnapshot("no snapshot stored".into()))?;
        let snapshot = PauseSnapshot::from_json(raw)?;
        let graph: Arc<Graph> = validate_dag(&workflow.graph)?;

        let ids = RunIds { workflow_id: workflow.id, run_id };
        let inputs = row.inputs.0.as_object().cloned().unwrap_or_default();
        let engine = GraphEngine::resume(graph, snapshot, payload, ids, self.config.clone(), self.services.clone())?
            .with_layer(self.persistence(workflow, run_id))
            .with_bus(self.bus.clone())
            .with_run_inputs(inputs);
        Ok(PreparedRun { run_id, engine })
    }

    #[instrument(skip(self, workflow, payload), fields(workflow_id = %workflow.id))]
    pub async fn resume(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        payload: Option<Map<String, Value>>,
    ) -> Result<ExecutionResult, EngineError> {
        let prepared = self.prepare_resume(workflow, run_id, payload).await?;
        info!(%run_id, "Resuming workflow '{}'", workflow.name);
        let outcome = prepared.engine.run().await;
        Ok(ExecutionResult { execution_id: run_id, outcome })
    }

    fn persistence(&self, workflow: &Workflow, run_id: Uuid) -> PersistenceLayer {
        let metadata = WorkflowMetadata {
            workflow_id: workflow.id,
            workflow_type: workflow.workflow_type.clone(),
            version: workflow.version.clone(),
            graph: serde_json::to_value(&workflow.graph).unwrap_or_default(),
        };
        let layer = PersistenceLayer::new(self.pool.clone(), run_id, metadata);
        match &self.trace_tx {
            Some(tx) => layer.with_trace_queue(tx.clone()),
            None => layer,
        }
    }
}
