//! The `ExecutableNode` trait: the contract every node must fulfil.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::services::NodeServices;
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Incremental output chunk produced while a node is still running.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    /// Output the chunk belongs to, e.g. `llm_1.text`.
    pub selector: Selector,
    pub chunk: String,
}

/// Callback handle a node uses to publish stream chunks.
///
/// The engine installs a sink per attempt that tags chunks with the
/// attempt's execution id; nodes only see the selector/chunk pair.
#[derive(Clone, Default)]
pub struct StreamSink {
    emit: Option<Arc<dyn Fn(StreamChunk) + Send + Sync>>,
}

impl StreamSink {
    pub fn new(emit: impl Fn(StreamChunk) + Send + Sync + 'static) -> Self {
        Self { emit: Some(Arc::new(emit)) }
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { emit: None }
    }

    pub fn send(&self, selector: &Selector, chunk: impl Into<String>) {
        if let Some(emit) = &self.emit {
            emit(StreamChunk { selector: selector.clone(), chunk: chunk.into() });
        }
    }
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink").field("enabled", &self.emit.is_some()).finish()
    }
}

/// Shared context passed to every node during execution.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the workflow definition.
    pub workflow_id: uuid::Uuid,
    /// ID of the current run.
    pub run_id: uuid::Uuid,
    /// ID of this node attempt; retries get a fresh one.
    pub execution_id: uuid::Uuid,
    pub node_id: String,
    pub stream: StreamSink,
    /// Payload supplied by the caller when a paused run is resumed.
    pub resume_payload: Option<Map<String, Value>>,
    pub services: NodeServices,
}

/// Usage accounting attached to a node result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRunMetadata {
    pub total_tokens: u64,
}

/// Everything a successful node attempt produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRunResult {
    /// Input values as the node saw them, for persistence.
    pub inputs: Map<String, Value>,
    pub process_data: Map<String, Value>,
    pub outputs: BTreeMap<String, Segment>,
    /// Handle of the outgoing edges to take; `None` means the default handle.
    pub edge_source_handle: Option<String>,
    /// Writes to existing variables (conversation variables, loop variables).
    pub updated_variables: Vec<(Selector, Segment)>,
    /// Additional pool scopes produced by container nodes for their inner nodes.
    pub extra_scopes: Vec<(String, BTreeMap<String, Segment>)>,
    pub metadata: NodeRunMetadata,
}

impl NodeRunResult {
    pub fn with_outputs(outputs: BTreeMap<String, Segment>) -> Self {
        Self { outputs, ..Self::default() }
    }

    /// JSON object view of the outputs.
    pub fn outputs_json(&self) -> Map<String, Value> {
        self.outputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
    }
}

/// How a node attempt ended when it did not error.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Completed(NodeRunResult),
    /// The node needs external input before it can finish.
    PauseRequested { reason: String },
}

/// The core node trait.
///
/// Every built-in node kind implements this; the engine never inspects a
/// node beyond these two methods.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Pool selectors this node reads. The engine snapshots exactly these
    /// before dispatch.
    fn input_selectors(&self) -> Vec<Selector>;

    async fn execute(&self, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError>;
}
