//! The control loop.
//!
//! One `GraphEngine` owns a run: the variable pool, the route state and the
//! ready queue. Node bodies run on worker tasks and report back over a
//! channel; every state transition and every event happens here, in a
//! single task, in the order results arrive.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nodes::builtin::inputs_json;
use nodes::config::{ErrorStrategy, NodeKind};
use nodes::{
    BuiltinNode, ExecutableNode, ExecutionContext, NodeError, NodeInputs, NodeOutcome, NodeRunResult, NodeServices,
    Segment, StreamChunk, StreamSink,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::container::{self, ContainerRun};
use crate::dag::{edge_matches, Graph, GraphNode};
use crate::events::{EngineLayer, EventBus, GraphEvent, NodeEventInfo, NodeResultData};
use crate::executor::ExecutorConfig;
use crate::models::{DEFAULT_SOURCE_HANDLE, FAIL_BRANCH_HANDLE};
use crate::pool::VariablePool;
use crate::reachability::ReachabilityChecker;
use crate::route::{EdgeState, RouteNodeStatus, RouteState};
use crate::snapshot::{PauseSnapshot, SNAPSHOT_VERSION};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// External control signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Stop now; in-flight results are discarded.
    Abort { reason: String },
    /// Stop dispatching, let in-flight nodes finish, then snapshot.
    Pause { reason: String },
}

/// Cloneable handle for sending [`EngineCommand`]s to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    /// Returns `false` when the run has already finished.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.tx.send(EngineCommand::Abort { reason: reason.into() }).is_ok()
    }

    pub fn pause(&self, reason: impl Into<String>) -> bool {
        self.tx.send(EngineCommand::Pause { reason: reason.into() }).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartialSucceeded,
    Failed,
    Stopped,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::PartialSucceeded => "partial_succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub outputs: Map<String, Value>,
    /// Failure message or abort reason.
    pub error: Option<String>,
    pub exceptions_count: u32,
    pub total_tokens: u64,
    pub steps: u32,
    pub snapshot: Option<PauseSnapshot>,
    pub paused_node_ids: Vec<String>,
    /// Final pool; container nodes read their sub-run results from it.
    pub pool: VariablePool,
}

/// A node waiting to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyNode {
    pub node_id: String,
    pub predecessor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunIds {
    pub workflow_id: Uuid,
    pub run_id: Uuid,
}

// ---------------------------------------------------------------------------
// Worker protocol
// ---------------------------------------------------------------------------

pub(crate) struct WorkerMessage {
    pub execution_id: Uuid,
    pub kind: WorkerMessageKind,
}

pub(crate) enum WorkerMessageKind {
    Chunk(StreamChunk),
    /// An event produced on the worker side (container sub-runs).
    Event(GraphEvent),
    Finished(Result<NodeOutcome, NodeError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContainerKind {
    Iteration,
    Loop,
}

/// Which container pass a child engine runs for.
#[derive(Debug, Clone)]
pub(crate) struct ContainerScope {
    pub container_id: String,
    pub kind: ContainerKind,
    pub index: usize,
}

impl ContainerScope {
    fn tag(&self, info: &mut NodeEventInfo) {
        let slot = match self.kind {
            ContainerKind::Iteration => &mut info.iteration_id,
            ContainerKind::Loop => &mut info.loop_id,
        };
        if slot.is_none() {
            *slot = Some(self.container_id.clone());
        }
        if info.container_index.is_none() {
            info.container_index = Some(self.index);
        }
    }
}

enum EventSink {
    Root {
        layers: Vec<Box<dyn EngineLayer>>,
        bus: Option<EventBus>,
    },
    /// Sub-run of a container: node events go up to the parent's worker
    /// channel, run events are dropped.
    Child {
        tx: UnboundedSender<WorkerMessage>,
        container_execution_id: Uuid,
        scope: ContainerScope,
    },
}

enum NodeJob {
    Leaf(Arc<BuiltinNode>),
    Iteration(nodes::config::IterationNodeData, ContainerRun),
    Loop(nodes::config::LoopNodeData, ContainerRun),
}

async fn execute_job(job: NodeJob, inputs: NodeInputs, ctx: ExecutionContext) -> Result<NodeOutcome, NodeError> {
    match job {
        NodeJob::Leaf(node) => node.execute(inputs, &ctx).await,
        NodeJob::Iteration(data, run) => container::run_iteration(run, &data, inputs).await,
        NodeJob::Loop(data, run) => container::run_loop(run, &data, inputs).await,
    }
}

struct InFlight {
    node_id: String,
    predecessor: Option<String>,
    retry_index: u32,
    info: NodeEventInfo,
    inputs: Map<String, Value>,
}

enum Stop {
    Failed(String),
    Aborted(String),
}

enum Wake {
    Worker(WorkerMessage),
    Command(EngineCommand),
    Reaped,
}

async fn next_command(rx: &mut Option<UnboundedReceiver<EngineCommand>>) -> Option<EngineCommand> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// GraphEngine
// ---------------------------------------------------------------------------

pub struct GraphEngine {
    graph: Arc<Graph>,
    ids: RunIds,
    config: ExecutorConfig,
    services: NodeServices,

    pool: VariablePool,
    route: RouteState,
    ready: VecDeque<ReadyNode>,
    running: HashMap<Uuid, InFlight>,
    /// Queued or started at least once.
    dispatched: BTreeSet<String>,
    skipped: BTreeSet<String>,

    outputs: Map<String, Value>,
    exceptions_count: u32,
    steps: u32,
    total_tokens: u64,

    pausing: bool,
    paused_node_ids: Vec<String>,
    /// Paused nodes to re-run first after a resume.
    resume_queue: Vec<ReadyNode>,
    awaiting_payload: HashSet<String>,
    resume_payload: Option<Map<String, Value>>,
    resumed: bool,
    run_inputs: Map<String, Value>,

    sink: EventSink,
    command_tx: UnboundedSender<EngineCommand>,
    commands: Option<UnboundedReceiver<EngineCommand>>,
}

impl GraphEngine {
    /// A fresh run starting at the graph's root.
    pub fn new(
        graph: Arc<Graph>,
        pool: VariablePool,
        ids: RunIds,
        config: ExecutorConfig,
        services: NodeServices,
    ) -> Self {
        let sink = EventSink::Root { layers: Vec::new(), bus: None };
        Self::build(graph, pool, ids, config, services, sink)
    }

    /// Rebuild a paused run. Paused nodes are re-run first and receive
    /// `payload` through their execution context.
    pub fn resume(
        graph: Arc<Graph>,
        snapshot: PauseSnapshot,
        payload: Option<Map<String, Value>>,
        ids: RunIds,
        config: ExecutorConfig,
        services: NodeServices,
    ) -> Result<Self, EngineError> {
        snapshot.check_against(&graph)?;
        let sink = EventSink::Root { layers: Vec::new(), bus: None };
        let mut engine = Self::build(graph, snapshot.pool, ids, config, services, sink);

        engine.route = snapshot.route;
        engine.ready = snapshot.ready.into();
        engine.dispatched = snapshot.dispatched;
        engine.skipped = snapshot.skipped;
        engine.outputs = snapshot.outputs;
        engine.exceptions_count = snapshot.exceptions_count;
        engine.steps = snapshot.steps;
        engine.total_tokens = snapshot.total_tokens;
        engine.resume_queue = snapshot
            .paused_node_ids
            .iter()
            .map(|id| ReadyNode {
                node_id: id.clone(),
                predecessor: engine.route.latest(id).and_then(|a| a.predecessor_node_id.clone()),
            })
            .collect();
        engine.awaiting_payload = snapshot.paused_node_ids.into_iter().collect();
        engine.resume_payload = payload;
        engine.resumed = true;
        Ok(engine)
    }

    pub(crate) fn child(
        graph: Arc<Graph>,
        pool: VariablePool,
        ids: RunIds,
        config: ExecutorConfig,
        services: NodeServices,
        tx: UnboundedSender<WorkerMessage>,
        container_execution_id: Uuid,
        scope: ContainerScope,
    ) -> Self {
        let sink = EventSink::Child { tx, container_execution_id, scope };
        Self::build(graph, pool, ids, config, services, sink)
    }

    fn build(
        graph: Arc<Graph>,
        pool: VariablePool,
        ids: RunIds,
        config: ExecutorConfig,
        services: NodeServices,
        sink: EventSink,
    ) -> Self {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let root = graph.root_id().to_string();
        Self {
            route: RouteState::new(graph.edges().len()),
            ready: VecDeque::from([ReadyNode { node_id: root.clone(), predecessor: None }]),
            dispatched: BTreeSet::from([root]),
            graph,
            ids,
            config,
            services,
            pool,
            running: HashMap::new(),
            skipped: BTreeSet::new(),
            outputs: Map::new(),
            exceptions_count: 0,
            steps: 0,
            total_tokens: 0,
            pausing: false,
            paused_node_ids: Vec::new(),
            resume_queue: Vec::new(),
            awaiting_payload: HashSet::new(),
            resume_payload: None,
            resumed: false,
            run_inputs: Map::new(),
            sink,
            command_tx,
            commands: Some(commands),
        }
    }

    /// Await `layer` for every event, in order.
    pub fn with_layer(mut self, layer: impl EngineLayer + 'static) -> Self {
        if let EventSink::Root { layers, .. } = &mut self.sink {
            layers.push(Box::new(layer));
        }
        self
    }

    pub fn with_bus(mut self, event_bus: EventBus) -> Self {
        if let EventSink::Root { bus, .. } = &mut self.sink {
            *bus = Some(event_bus);
        }
        self
    }

    /// Inputs reported on `RunStarted`.
    pub fn with_run_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.run_inputs = inputs;
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle { tx: self.command_tx.clone() }
    }

    pub fn pool(&self) -> &VariablePool {
        &self.pool
    }

    /// Drive the run to a terminal (or paused) state.
    pub async fn run(mut self) -> RunOutcome {
        if matches!(self.sink, EventSink::Root { .. }) {
            info!(run_id = %self.ids.run_id, resumed = self.resumed, "Graph run started");
        }
        let started = GraphEvent::RunStarted {
            run_id: self.ids.run_id,
            workflow_id: self.ids.workflow_id,
            inputs: self.run_inputs.clone(),
            resumed: self.resumed,
        };
        self.emit(started).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut commands = self.commands.take();
        let mut stop: Option<Stop> = None;

        for node in std::mem::take(&mut self.resume_queue) {
            if let Err(error) = self.start_node(node.node_id, node.predecessor, 0, None, &tx, &mut tasks).await {
                stop = Some(Stop::Failed(error));
                break;
            }
        }

        loop {
            if stop.is_none() && !self.pausing {
                if let Err(error) = self.dispatch_ready(&tx, &mut tasks).await {
                    stop = Some(Stop::Failed(error));
                }
            }
            if stop.is_some() || self.running.is_empty() {
                break;
            }

            let wake = tokio::select! {
                Some(message) = rx.recv() => Wake::Worker(message),
                Some(command) = next_command(&mut commands) => Wake::Command(command),
                Some(_) = tasks.join_next(), if !tasks.is_empty() => Wake::Reaped,
            };

            match wake {
                Wake::Worker(message) => stop = self.on_worker_message(message, &tx, &mut tasks).await,
                Wake::Command(EngineCommand::Abort { reason }) => {
                    info!(run_id = %self.ids.run_id, %reason, "Abort requested");
                    stop = Some(Stop::Aborted(reason));
                }
                Wake::Command(EngineCommand::Pause { reason }) => {
                    info!(run_id = %self.ids.run_id, %reason, "Pause requested");
                    self.pausing = true;
                }
                Wake::Reaped => {}
            }
        }

        // In-flight nodes keep running; their results are never applied.
        tasks.detach_all();
        self.finish(stop).await
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch_ready(
        &mut self,
        tx: &UnboundedSender<WorkerMessage>,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), String> {
        let limit = self.config.max_concurrent_nodes.max(1);
        while self.running.len() < limit {
            let Some(next) = self.ready.pop_front() else { break };
            self.start_node(next.node_id, next.predecessor, 0, None, tx, tasks).await?;
        }
        Ok(())
    }

    async fn start_node(
        &mut self,
        node_id: String,
        predecessor: Option<String>,
        retry_index: u32,
        delay: Option<Duration>,
        tx: &UnboundedSender<WorkerMessage>,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), String> {
        if self.steps >= self.config.max_steps {
            return Err(format!("max steps exceeded ({})", self.config.max_steps));
        }
        let Some(node) = self.graph.node(&node_id).cloned() else {
            return Err(format!("node '{node_id}' is not part of the graph"));
        };
        self.steps += 1;
        self.dispatched.insert(node_id.clone());

        let execution_id = self.route.start_attempt(&node_id, predecessor.clone(), retry_index);
        let mut info = NodeEventInfo {
            execution_id,
            node_id: node_id.clone(),
            node_type: node.node_type().to_string(),
            title: node.title().to_string(),
            predecessor_node_id: predecessor.clone(),
            iteration_id: None,
            loop_id: None,
            container_index: None,
            started_at: Utc::now(),
        };
        if let EventSink::Child { scope, .. } = &self.sink {
            scope.tag(&mut info);
        }

        let inputs = self.pool.snapshot(&node.input_selectors());
        let job = match (&node.executable, &node.data.kind) {
            (Some(executable), _) => NodeJob::Leaf(executable.clone()),
            (None, NodeKind::Iteration(data)) => NodeJob::Iteration(data.clone(), self.container_run(&node, &info, tx)?),
            (None, NodeKind::Loop(data)) => NodeJob::Loop(data.clone(), self.container_run(&node, &info, tx)?),
            (None, kind) => return Err(format!("node '{node_id}' of type '{}' cannot run", kind.type_name())),
        };

        let chunk_tx = tx.clone();
        let ctx = ExecutionContext {
            workflow_id: self.ids.workflow_id,
            run_id: self.ids.run_id,
            execution_id,
            node_id: node_id.clone(),
            stream: StreamSink::new(move |chunk| {
                let _ = chunk_tx.send(WorkerMessage { execution_id, kind: WorkerMessageKind::Chunk(chunk) });
            }),
            resume_payload: if self.awaiting_payload.remove(&node_id) { self.resume_payload.clone() } else { None },
            services: self.services.clone(),
        };

        debug!(node_id = %node_id, %execution_id, retry_index, "Dispatching node");
        self.emit(GraphEvent::NodeStarted { info: info.clone() }).await;
        self.running.insert(
            execution_id,
            InFlight { node_id, predecessor, retry_index, info, inputs: inputs_json(&inputs) },
        );

        let worker_tx = tx.clone();
        tasks.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            // A panicking node must still report back.
            let result = match tokio::spawn(execute_job(job, inputs, ctx)).await {
                Ok(result) => result,
                Err(join_error) => Err(NodeError::Fatal(format!("node task failed: {join_error}"))),
            };
            let _ = worker_tx.send(WorkerMessage { execution_id, kind: WorkerMessageKind::Finished(result) });
        });
        Ok(())
    }

    fn container_run(
        &self,
        node: &GraphNode,
        info: &NodeEventInfo,
        tx: &UnboundedSender<WorkerMessage>,
    ) -> Result<ContainerRun, String> {
        let graph = self
            .graph
            .subgraph(&node.id)
            .cloned()
            .ok_or_else(|| format!("container '{}' has no sub-graph", node.id))?;
        Ok(ContainerRun {
            graph,
            pool: self.pool.clone(),
            ids: self.ids,
            config: self.config.clone(),
            services: self.services.clone(),
            tx: tx.clone(),
            info: info.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Worker results
    // -----------------------------------------------------------------------

    async fn on_worker_message(
        &mut self,
        message: WorkerMessage,
        tx: &UnboundedSender<WorkerMessage>,
        tasks: &mut JoinSet<()>,
    ) -> Option<Stop> {
        match message.kind {
            WorkerMessageKind::Chunk(chunk) => {
                self.on_chunk(message.execution_id, chunk).await;
                None
            }
            WorkerMessageKind::Event(event) => {
                if self.running.contains_key(&message.execution_id) {
                    self.emit(event).await;
                }
                None
            }
            WorkerMessageKind::Finished(result) => self.on_finished(message.execution_id, result, tx, tasks).await,
        }
    }

    async fn on_chunk(&mut self, execution_id: Uuid, chunk: StreamChunk) {
        let Some(flight) = self.running.get(&execution_id) else { return };
        let checker = ReachabilityChecker::new(&self.graph, &self.route);
        let sinks: Vec<String> = self
            .graph
            .sinks_reading(&chunk.selector)
            .into_iter()
            .filter(|sink| self.route.finished(sink).is_none())
            .map(String::from)
            .collect();
        let safe_sinks: Vec<String> =
            sinks.iter().filter(|sink| checker.is_safe_to_stream(sink, &flight.node_id)).cloned().collect();
        let event = GraphEvent::NodeStreamChunk {
            info: flight.info.clone(),
            selector: chunk.selector,
            chunk: chunk.chunk,
            sinks,
            safe_sinks,
        };
        self.emit(event).await;
    }

    async fn on_finished(
        &mut self,
        execution_id: Uuid,
        result: Result<NodeOutcome, NodeError>,
        tx: &UnboundedSender<WorkerMessage>,
        tasks: &mut JoinSet<()>,
    ) -> Option<Stop> {
        let flight = self.running.remove(&execution_id)?;
        let node = self.graph.node(&flight.node_id).cloned()?;

        match result {
            Ok(NodeOutcome::Completed(result)) => {
                self.on_success(execution_id, flight, &node, result).await;
                None
            }
            Ok(NodeOutcome::PauseRequested { reason }) => {
                info!(node_id = %flight.node_id, %reason, "Node requested a pause");
                self.route.finish_attempt(execution_id, RouteNodeStatus::Paused, None, None);
                self.paused_node_ids.push(flight.node_id.clone());
                self.pausing = true;
                self.emit(GraphEvent::NodePauseRequested { info: flight.info, reason }).await;
                None
            }
            Err(error) => self.on_failure(execution_id, flight, &node, error, tx, tasks).await,
        }
    }

    async fn on_success(&mut self, execution_id: Uuid, flight: InFlight, node: &GraphNode, result: NodeRunResult) {
        let handle = result.edge_source_handle.clone().unwrap_or_else(|| DEFAULT_SOURCE_HANDLE.to_string());
        self.route.finish_attempt(execution_id, RouteNodeStatus::Succeeded, Some(handle.clone()), None);

        self.store_scope(&flight.node_id, result.outputs.clone());
        for (selector, value) in result.updated_variables.iter().cloned() {
            if !self.pool.add(&selector, value) {
                warn!(node_id = %flight.node_id, %selector, "Variable update rejected");
            }
        }
        for (scope, values) in result.extra_scopes.iter().cloned() {
            self.store_scope(&scope, values);
        }
        self.total_tokens += result.metadata.total_tokens;
        self.collect_run_outputs(node, &result);

        let data = NodeResultData {
            inputs: if result.inputs.is_empty() { flight.inputs } else { result.inputs.clone() },
            process_data: result.process_data.clone(),
            outputs: result.outputs_json(),
            total_tokens: result.metadata.total_tokens,
            edge_source_handle: Some(handle.clone()),
        };
        self.emit(GraphEvent::NodeSucceeded { info: flight.info, result: data }).await;
        self.resolve_edges(&flight.node_id, Some(&handle));
    }

    async fn on_failure(
        &mut self,
        execution_id: Uuid,
        flight: InFlight,
        node: &GraphNode,
        error: NodeError,
        tx: &UnboundedSender<WorkerMessage>,
        tasks: &mut JoinSet<()>,
    ) -> Option<Stop> {
        let message = error.to_string();
        let retry = node.data.retry_config;

        if error.is_retryable() && flight.retry_index < retry.max_retries {
            warn!(
                node_id = %flight.node_id,
                attempt = flight.retry_index + 1,
                max_retries = retry.max_retries,
                error = %message,
                "Retryable node error, retrying"
            );
            self.route.finish_attempt(execution_id, RouteNodeStatus::Retry, None, Some(message.clone()));
            self.emit(GraphEvent::NodeRetry { info: flight.info, error: message, retry_index: flight.retry_index })
                .await;
            let delay = if retry.retry_interval_ms > 0 {
                Duration::from_millis(retry.retry_interval_ms)
            } else {
                self.config.retry_base_delay.saturating_mul(2u32.saturating_pow(flight.retry_index))
            };
            return self
                .start_node(flight.node_id, flight.predecessor, flight.retry_index + 1, Some(delay), tx, tasks)
                .await
                .err()
                .map(Stop::Failed);
        }

        let handled = match node.data.error_strategy {
            ErrorStrategy::TerminateRun => None,
            ErrorStrategy::FailBranch => Some((error_outputs(&error), Some(FAIL_BRANCH_HANDLE.to_string()))),
            ErrorStrategy::RemoveNode => Some((Default::default(), continue_handle(node))),
            ErrorStrategy::DefaultValue => {
                let mut outputs = node.data.default_outputs();
                outputs.extend(error_outputs(&error));
                Some((outputs, continue_handle(node)))
            }
        };

        let Some((outputs, handle)) = handled else {
            error!(node_id = %flight.node_id, error = %message, "Node failed, terminating run");
            self.route.finish_attempt(execution_id, RouteNodeStatus::Failed, None, Some(message.clone()));
            let event = GraphEvent::NodeFailed {
                info: flight.info,
                error: message.clone(),
                error_type: error.error_type().to_string(),
                inputs: flight.inputs,
            };
            self.emit(event).await;
            return Some(Stop::Failed(format!("node '{}' failed: {message}", flight.node_id)));
        };

        warn!(
            node_id = %flight.node_id,
            strategy = ?node.data.error_strategy,
            error = %message,
            "Node failed, continuing under its error strategy"
        );
        self.exceptions_count += 1;
        self.route.finish_attempt(execution_id, RouteNodeStatus::Exception, handle.clone(), Some(message.clone()));
        self.store_scope(&flight.node_id, outputs.clone());

        let data = NodeResultData {
            inputs: flight.inputs,
            process_data: Map::new(),
            outputs: outputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            total_tokens: 0,
            edge_source_handle: handle.clone(),
        };
        let event = GraphEvent::NodeException {
            info: flight.info,
            error: message,
            error_type: error.error_type().to_string(),
            result: data,
        };
        self.emit(event).await;
        self.resolve_edges(&flight.node_id, handle.as_deref());
        None
    }

    fn store_scope(&mut self, scope: &str, values: std::collections::BTreeMap<String, Segment>) {
        if !self.pool.set_scope(scope, values) {
            warn!(scope, "Outputs not stored, scope id is reserved");
        }
    }

    fn collect_run_outputs(&mut self, node: &GraphNode, result: &NodeRunResult) {
        match &node.data.kind {
            NodeKind::Answer(_) => {
                let text = result.outputs.get("answer").map(Segment::text).unwrap_or_default();
                let merged = match self.outputs.get("answer").and_then(Value::as_str) {
                    Some(existing) => format!("{existing}{text}"),
                    None => text,
                };
                self.outputs.insert("answer".to_string(), Value::String(merged));
            }
            NodeKind::End(_) => self.outputs.extend(result.outputs_json()),
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Edge resolution
    // -----------------------------------------------------------------------

    /// Mark the node's outgoing edges taken or skipped and enqueue
    /// whatever became ready.
    fn resolve_edges(&mut self, node_id: &str, handle: Option<&str>) {
        let graph = self.graph.clone();
        let mut targets: Vec<String> = Vec::new();
        for &index in graph.outgoing(node_id) {
            let edge = graph.edge(index);
            let state = if edge_matches(edge, handle) { EdgeState::Taken } else { EdgeState::Skipped };
            self.route.set_edge_state(index, state);
            if !targets.contains(&edge.target) {
                targets.push(edge.target.clone());
            }
        }

        let mut stack: Vec<(String, String)> =
            targets.into_iter().rev().map(|t| (t, node_id.to_string())).collect();
        while let Some((target, predecessor)) = stack.pop() {
            if self.dispatched.contains(&target) || self.skipped.contains(&target) {
                continue;
            }
            let states: Vec<EdgeState> = graph.incoming(&target).iter().map(|&i| self.route.edge_state(i)).collect();
            if states.contains(&EdgeState::Unknown) {
                continue;
            }
            if states.contains(&EdgeState::Taken) {
                self.dispatched.insert(target.clone());
                self.ready.push_back(ReadyNode { node_id: target, predecessor: Some(predecessor) });
                continue;
            }

            debug!(node_id = %target, "All incoming edges skipped, skipping node");
            self.skipped.insert(target.clone());
            for &index in graph.outgoing(&target) {
                self.route.set_edge_state(index, EdgeState::Skipped);
                stack.push((graph.edge(index).target.clone(), target.clone()));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    async fn emit(&mut self, mut event: GraphEvent) {
        match &mut self.sink {
            EventSink::Root { layers, bus } => {
                for layer in layers.iter_mut() {
                    if let Err(e) = layer.on_event(&event).await {
                        warn!(event = event.name(), error = %e, "Engine layer failed to handle event");
                    }
                }
                if let Some(bus) = bus {
                    bus.publish(event);
                }
            }
            EventSink::Child { tx, container_execution_id, scope } => {
                if event.is_run_event() {
                    return;
                }
                if let Some(info) = event.node_info_mut() {
                    scope.tag(info);
                }
                let _ = tx.send(WorkerMessage {
                    execution_id: *container_execution_id,
                    kind: WorkerMessageKind::Event(event),
                });
            }
        }
    }

    fn snapshot(&self) -> PauseSnapshot {
        PauseSnapshot {
            version: SNAPSHOT_VERSION,
            pool: self.pool.clone(),
            route: self.route.clone(),
            ready: self.ready.iter().cloned().collect(),
            paused_node_ids: self.paused_node_ids.clone(),
            outputs: self.outputs.clone(),
            exceptions_count: self.exceptions_count,
            steps: self.steps,
            total_tokens: self.total_tokens,
            dispatched: self.dispatched.clone(),
            skipped: self.skipped.clone(),
        }
    }

    async fn finish(mut self, stop: Option<Stop>) -> RunOutcome {
        let (exceptions_count, total_tokens, steps) = (self.exceptions_count, self.total_tokens, self.steps);
        let mut snapshot = None;

        let (status, run_error) = match stop {
            Some(Stop::Failed(error)) => (RunStatus::Failed, Some(error)),
            Some(Stop::Aborted(reason)) => (RunStatus::Stopped, Some(reason)),
            None if !self.paused_node_ids.is_empty() || (self.pausing && !self.ready.is_empty()) => {
                let taken = self.snapshot();
                match taken.to_json() {
                    Ok(raw) => {
                        let event = GraphEvent::RunPaused {
                            outputs: self.outputs.clone(),
                            paused_node_ids: self.paused_node_ids.clone(),
                            snapshot: raw,
                            exceptions_count,
                            total_tokens,
                            steps,
                        };
                        self.emit(event).await;
                        snapshot = Some(taken);
                        (RunStatus::Paused, None)
                    }
                    Err(e) => (RunStatus::Failed, Some(e.to_string())),
                }
            }
            None if exceptions_count > 0 => (RunStatus::PartialSucceeded, None),
            None => (RunStatus::Succeeded, None),
        };

        let terminal = match status {
            RunStatus::Failed => Some(GraphEvent::RunFailed {
                error: run_error.clone().unwrap_or_default(),
                exceptions_count,
                total_tokens,
                steps,
            }),
            RunStatus::Stopped => Some(GraphEvent::RunAborted {
                reason: run_error.clone().unwrap_or_default(),
                outputs: self.outputs.clone(),
                exceptions_count,
                total_tokens,
                steps,
            }),
            RunStatus::PartialSucceeded => Some(GraphEvent::RunPartialSucceeded {
                outputs: self.outputs.clone(),
                exceptions_count,
                total_tokens,
                steps,
            }),
            RunStatus::Succeeded => Some(GraphEvent::RunSucceeded { outputs: self.outputs.clone(), total_tokens, steps }),
            RunStatus::Paused => None,
        };
        if let Some(event) = terminal {
            self.emit(event).await;
        }

        if matches!(self.sink, EventSink::Root { .. }) {
            info!(run_id = %self.ids.run_id, %status, steps, total_tokens, exceptions_count, "Graph run finished");
        }

        RunOutcome {
            status,
            outputs: self.outputs,
            error: run_error,
            exceptions_count,
            total_tokens,
            steps,
            snapshot,
            paused_node_ids: self.paused_node_ids,
            pool: self.pool,
        }
    }
}

/// Outputs a failed node exposes under `fail-branch` / `default-value`.
fn error_outputs(error: &NodeError) -> std::collections::BTreeMap<String, Segment> {
    std::collections::BTreeMap::from([
        ("error_message".to_string(), Segment::String(error.to_string())),
        ("error_type".to_string(), Segment::String(error.error_type().to_string())),
    ])
}

/// Edge handle a failed node continues on; branching nodes have no
/// decision to offer, so all of their branches are skipped.
fn continue_handle(node: &GraphNode) -> Option<String> {
    if node.is_branching() {
        None
    } else {
        Some(DEFAULT_SOURCE_HANDLE.to_string())
    }
}
