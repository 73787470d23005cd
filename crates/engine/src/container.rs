//! Iteration and loop nodes.
//!
//! A container runs its sub-graph on a child [`GraphEngine`] per pass. Each
//! pass works on its own copy of the pool; inner node scopes come back to
//! the parent re-keyed as `"{node}#{index}"` so passes never clobber each
//! other.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use nodes::condition::evaluate_all;
use nodes::config::{AssignerInputType, IterationErrorMode, IterationNodeData, LoopNodeData};
use nodes::{NodeError, NodeInputs, NodeOutcome, NodeRunResult, NodeServices, Segment, Selector};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::dag::{Graph, CONTAINER_INDEX_SEPARATOR};
use crate::events::{GraphEvent, NodeEventInfo};
use crate::executor::ExecutorConfig;
use crate::graph_engine::{
    ContainerKind, ContainerScope, GraphEngine, RunIds, RunOutcome, RunStatus, WorkerMessage, WorkerMessageKind,
};
use crate::pool::VariablePool;

/// Everything a container needs from the parent engine.
pub(crate) struct ContainerRun {
    pub graph: Arc<Graph>,
    pub pool: VariablePool,
    pub ids: RunIds,
    pub config: ExecutorConfig,
    pub services: NodeServices,
    pub tx: UnboundedSender<WorkerMessage>,
    /// Event info of the container node itself.
    pub info: NodeEventInfo,
}

impl ContainerRun {
    fn send(&self, event: GraphEvent) {
        let _ = self.tx.send(WorkerMessage {
            execution_id: self.info.execution_id,
            kind: WorkerMessageKind::Event(event),
        });
    }

    fn pass(&self, kind: ContainerKind, index: usize, pool: VariablePool) -> Pin<Box<dyn Future<Output = RunOutcome> + Send>> {
        let scope = ContainerScope { container_id: self.info.node_id.clone(), kind, index };
        let engine = GraphEngine::child(
            self.graph.clone(),
            pool,
            self.ids,
            self.config.clone(),
            self.services.clone(),
            self.tx.clone(),
            self.info.execution_id,
            scope,
        );
        Box::pin(engine.run())
    }

    /// Inner scopes of a finished pass, re-keyed by pass index.
    fn rekeyed_scopes(&self, pool: &VariablePool, index: usize) -> Vec<(String, BTreeMap<String, Segment>)> {
        self.graph
            .all_node_ids()
            .into_iter()
            .map(|id| {
                let values = pool.get_by_prefix(&id);
                (format!("{id}{CONTAINER_INDEX_SEPARATOR}{index}"), values)
            })
            .filter(|(_, values)| !values.is_empty())
            .collect()
    }
}

fn pass_error(outcome: &RunOutcome) -> String {
    match outcome.status {
        RunStatus::Paused => "pausing inside a container is not supported".to_string(),
        _ => outcome.error.clone().unwrap_or_else(|| outcome.status.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

pub(crate) async fn run_iteration(
    run: ContainerRun,
    data: &IterationNodeData,
    inputs: NodeInputs,
) -> Result<NodeOutcome, NodeError> {
    let items: Vec<Segment> = match inputs.get(&data.iterator_selector) {
        None | Some(Segment::None) => Vec::new(),
        Some(Segment::Array(items)) => items.clone(),
        Some(Segment::ArrayFile(files)) => files.iter().cloned().map(Segment::File).collect(),
        Some(other) => {
            return Err(NodeError::InvalidInput(format!(
                "iterator '{}' must be an array, got {:?}",
                data.iterator_selector,
                other.segment_type()
            )))
        }
    };

    let container_id = run.info.node_id.clone();
    run.send(GraphEvent::IterationStarted { info: run.info.clone(), iterator_length: items.len() });

    let mut collected: Vec<Segment> = Vec::with_capacity(items.len());
    let mut extra_scopes = Vec::new();
    let mut total_tokens = 0;
    let mut passes = 0;

    for (index, item) in items.into_iter().enumerate() {
        run.send(GraphEvent::IterationNext { info: run.info.clone(), index });

        let mut pool = run.pool.clone();
        pool.add(&Selector::new(container_id.as_str(), "item"), item);
        pool.add(&Selector::new(container_id.as_str(), "index"), Segment::Integer(index as i64));

        let outcome = run.pass(ContainerKind::Iteration, index, pool).await;
        passes += 1;
        total_tokens += outcome.total_tokens;

        match outcome.status {
            RunStatus::Succeeded | RunStatus::PartialSucceeded => {
                collected.push(outcome.pool.get(&data.output_selector).unwrap_or(Segment::None));
                extra_scopes.extend(run.rekeyed_scopes(&outcome.pool, index));
            }
            RunStatus::Paused => {
                let error = pass_error(&outcome);
                run.send(GraphEvent::IterationFailed { info: run.info.clone(), error: error.clone() });
                return Err(NodeError::Unsupported(error));
            }
            RunStatus::Failed | RunStatus::Stopped => {
                let error = pass_error(&outcome);
                match data.error_handle_mode {
                    IterationErrorMode::Terminated => {
                        let error = format!("iteration {index} failed: {error}");
                        run.send(GraphEvent::IterationFailed { info: run.info.clone(), error: error.clone() });
                        return Err(NodeError::Fatal(error));
                    }
                    IterationErrorMode::ContinueOnError => {
                        warn!(container_id = %container_id, index, %error, "Iteration pass failed, continuing");
                        collected.push(Segment::None);
                    }
                    IterationErrorMode::RemoveAbnormalOutput => {
                        warn!(container_id = %container_id, index, %error, "Iteration pass failed, dropping its output");
                    }
                }
            }
        }
    }

    let outputs = BTreeMap::from([("output".to_string(), Segment::Array(collected))]);
    let outputs_json: Map<String, Value> = outputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    run.send(GraphEvent::IterationSucceeded { info: run.info.clone(), outputs: outputs_json, steps: passes });
    debug!(container_id = %container_id, passes, "Iteration finished");

    let mut result = NodeRunResult::with_outputs(outputs);
    result.inputs = nodes::builtin::inputs_json(&inputs);
    result.extra_scopes = extra_scopes;
    result.metadata.total_tokens = total_tokens;
    Ok(NodeOutcome::Completed(result))
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub(crate) async fn run_loop(run: ContainerRun, data: &LoopNodeData, inputs: NodeInputs) -> Result<NodeOutcome, NodeError> {
    let container_id = run.info.node_id.clone();

    let mut pool = run.pool.clone();
    for variable in &data.loop_variables {
        let value = match variable.value_type {
            AssignerInputType::Constant => Segment::from_json(variable.value.clone()),
            AssignerInputType::Variable => variable
                .value_selector()
                .and_then(|selector| inputs.get(&selector).cloned())
                .unwrap_or(Segment::None),
        };
        pool.add(&Selector::new(container_id.as_str(), variable.label.as_str()), value);
    }

    let break_selectors: Vec<Selector> = data.break_conditions.iter().map(|c| c.variable_selector.clone()).collect();
    let should_break = |pool: &VariablePool| {
        !data.break_conditions.is_empty()
            && evaluate_all(&data.break_conditions, data.logical_operator, &pool.snapshot(&break_selectors))
    };

    run.send(GraphEvent::LoopStarted { info: run.info.clone(), loop_count: data.loop_count });

    let mut extra_scopes = Vec::new();
    let mut total_tokens = 0;
    let mut passes = 0;

    while passes < data.loop_count as usize && !should_break(&pool) {
        let index = passes;
        run.send(GraphEvent::LoopNext { info: run.info.clone(), index });

        let outcome = run.pass(ContainerKind::Loop, index, pool.clone()).await;
        passes += 1;
        total_tokens += outcome.total_tokens;

        if !matches!(outcome.status, RunStatus::Succeeded | RunStatus::PartialSucceeded) {
            let error = format!("loop pass {index} failed: {}", pass_error(&outcome));
            run.send(GraphEvent::LoopFailed { info: run.info.clone(), error: error.clone() });
            return Err(match outcome.status {
                RunStatus::Paused => NodeError::Unsupported(error),
                _ => NodeError::Fatal(error),
            });
        }
        extra_scopes.extend(run.rekeyed_scopes(&outcome.pool, index));
        pool = outcome.pool;
    }

    let outputs: BTreeMap<String, Segment> = data
        .loop_variables
        .iter()
        .map(|v| {
            let value = pool.get(&Selector::new(container_id.as_str(), v.label.as_str())).unwrap_or(Segment::None);
            (v.label.clone(), value)
        })
        .collect();
    let outputs_json: Map<String, Value> = outputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    run.send(GraphEvent::LoopSucceeded { info: run.info.clone(), outputs: outputs_json, steps: passes });
    debug!(container_id = %container_id, passes, "Loop finished");

    let mut result = NodeRunResult::with_outputs(outputs);
    result.inputs = nodes::builtin::inputs_json(&inputs);
    result.extra_scopes = extra_scopes;
    result.metadata.total_tokens = total_tokens;
    Ok(NodeOutcome::Completed(result))
}
