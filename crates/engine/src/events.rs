//! The engine's outbound event stream and its fan-out.
//!
//! Events are emitted by the control loop only, in processing order.
//! [`EngineLayer`]s are awaited inline; everything else subscribes to the
//! bounded [`EventBus`] and may lag without slowing the run down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodes::Selector;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::EngineError;

/// Fields shared by every node-scoped event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeEventInfo {
    /// Attempt id; also the id of the persisted node execution.
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub title: String,
    pub predecessor_node_id: Option<String>,
    /// Set for nodes running inside an iteration / loop container.
    pub iteration_id: Option<String>,
    pub loop_id: Option<String>,
    /// Pass index inside the enclosing container.
    pub container_index: Option<usize>,
    pub started_at: DateTime<Utc>,
}

/// Payload of terminal node events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeResultData {
    pub inputs: Map<String, Value>,
    pub process_data: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub total_tokens: u64,
    pub edge_source_handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEvent {
    // ------ Run events ------
    RunStarted {
        run_id: Uuid,
        workflow_id: Uuid,
        inputs: Map<String, Value>,
        resumed: bool,
    },
    RunSucceeded {
        outputs: Map<String, Value>,
        total_tokens: u64,
        steps: u32,
    },
    RunPartialSucceeded {
        outputs: Map<String, Value>,
        exceptions_count: u32,
        total_tokens: u64,
        steps: u32,
    },
    RunFailed {
        error: String,
        exceptions_count: u32,
        total_tokens: u64,
        steps: u32,
    },
    RunAborted {
        reason: String,
        outputs: Map<String, Value>,
        exceptions_count: u32,
        total_tokens: u64,
        steps: u32,
    },
    RunPaused {
        outputs: Map<String, Value>,
        paused_node_ids: Vec<String>,
        /// Serialised pause snapshot.
        snapshot: String,
        exceptions_count: u32,
        total_tokens: u64,
        steps: u32,
    },

    // ------ Node events ------
    NodeStarted {
        #[serde(flatten)]
        info: NodeEventInfo,
    },
    NodeSucceeded {
        #[serde(flatten)]
        info: NodeEventInfo,
        result: NodeResultData,
    },
    NodeFailed {
        #[serde(flatten)]
        info: NodeEventInfo,
        error: String,
        error_type: String,
        inputs: Map<String, Value>,
    },
    /// Failed, handled by a non-terminating error strategy.
    NodeException {
        #[serde(flatten)]
        info: NodeEventInfo,
        error: String,
        error_type: String,
        result: NodeResultData,
    },
    NodeRetry {
        #[serde(flatten)]
        info: NodeEventInfo,
        error: String,
        retry_index: u32,
    },
    NodePauseRequested {
        #[serde(flatten)]
        info: NodeEventInfo,
        reason: String,
    },
    NodeStreamChunk {
        #[serde(flatten)]
        info: NodeEventInfo,
        selector: Selector,
        chunk: String,
        /// Unfinished answer nodes whose template reads `selector`. Empty
        /// when no answer consumes the chunk.
        sinks: Vec<String>,
        /// The subset of `sinks` this chunk may be forwarded to immediately.
        safe_sinks: Vec<String>,
    },

    // ------ Containers ------
    IterationStarted {
        #[serde(flatten)]
        info: NodeEventInfo,
        iterator_length: usize,
    },
    IterationNext {
        #[serde(flatten)]
        info: NodeEventInfo,
        index: usize,
    },
    IterationSucceeded {
        #[serde(flatten)]
        info: NodeEventInfo,
        outputs: Map<String, Value>,
        steps: usize,
    },
    IterationFailed {
        #[serde(flatten)]
        info: NodeEventInfo,
        error: String,
    },
    LoopStarted {
        #[serde(flatten)]
        info: NodeEventInfo,
        loop_count: u32,
    },
    LoopNext {
        #[serde(flatten)]
        info: NodeEventInfo,
        index: usize,
    },
    LoopSucceeded {
        #[serde(flatten)]
        info: NodeEventInfo,
        outputs: Map<String, Value>,
        steps: usize,
    },
    LoopFailed {
        #[serde(flatten)]
        info: NodeEventInfo,
        error: String,
    },
}

impl GraphEvent {
    /// Snake-case event name, as used in the serialised `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunSucceeded { .. } => "run_succeeded",
            Self::RunPartialSucceeded { .. } => "run_partial_succeeded",
            Self::RunFailed { .. } => "run_failed",
            Self::RunAborted { .. } => "run_aborted",
            Self::RunPaused { .. } => "run_paused",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeSucceeded { .. } => "node_succeeded",
            Self::NodeFailed { .. } => "node_failed",
            Self::NodeException { .. } => "node_exception",
            Self::NodeRetry { .. } => "node_retry",
            Self::NodePauseRequested { .. } => "node_pause_requested",
            Self::NodeStreamChunk { .. } => "node_stream_chunk",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationNext { .. } => "iteration_next",
            Self::IterationSucceeded { .. } => "iteration_succeeded",
            Self::IterationFailed { .. } => "iteration_failed",
            Self::LoopStarted { .. } => "loop_started",
            Self::LoopNext { .. } => "loop_next",
            Self::LoopSucceeded { .. } => "loop_succeeded",
            Self::LoopFailed { .. } => "loop_failed",
        }
    }

    pub fn is_run_event(&self) -> bool {
        matches!(
            self,
            Self::RunStarted { .. }
                | Self::RunSucceeded { .. }
                | Self::RunPartialSucceeded { .. }
                | Self::RunFailed { .. }
                | Self::RunAborted { .. }
                | Self::RunPaused { .. }
        )
    }

    /// The last event of a run. `RunPaused` counts: the stream ends there
    /// until the run is resumed.
    pub fn is_run_terminal(&self) -> bool {
        self.is_run_event() && !matches!(self, Self::RunStarted { .. })
    }

    pub fn node_info(&self) -> Option<&NodeEventInfo> {
        match self {
            Self::NodeStarted { info }
            | Self::NodeSucceeded { info, .. }
            | Self::NodeFailed { info, .. }
            | Self::NodeException { info, .. }
            | Self::NodeRetry { info, .. }
            | Self::NodePauseRequested { info, .. }
            | Self::NodeStreamChunk { info, .. }
            | Self::IterationStarted { info, .. }
            | Self::IterationNext { info, .. }
            | Self::IterationSucceeded { info, .. }
            | Self::IterationFailed { info, .. }
            | Self::LoopStarted { info, .. }
            | Self::LoopNext { info, .. }
            | Self::LoopSucceeded { info, .. }
            | Self::LoopFailed { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn node_info_mut(&mut self) -> Option<&mut NodeEventInfo> {
        match self {
            Self::NodeStarted { info }
            | Self::NodeSucceeded { info, .. }
            | Self::NodeFailed { info, .. }
            | Self::NodeException { info, .. }
            | Self::NodeRetry { info, .. }
            | Self::NodePauseRequested { info, .. }
            | Self::NodeStreamChunk { info, .. }
            | Self::IterationStarted { info, .. }
            | Self::IterationNext { info, .. }
            | Self::IterationSucceeded { info, .. }
            | Self::IterationFailed { info, .. }
            | Self::LoopStarted { info, .. }
            | Self::LoopNext { info, .. }
            | Self::LoopSucceeded { info, .. }
            | Self::LoopFailed { info, .. } => Some(info),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronous layers
// ---------------------------------------------------------------------------

/// A collaborator the control loop awaits for every event, in order.
///
/// Errors are logged by the engine and never abort the run.
#[async_trait]
pub trait EngineLayer: Send {
    async fn on_event(&mut self, event: &GraphEvent) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// Broadcast fan-out
// ---------------------------------------------------------------------------

/// Event bus using a tokio broadcast channel. Slow subscribers lose the
/// oldest events instead of blocking the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: GraphEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber { rx: self.tx.subscribe(), dropped: Arc::new(AtomicU64::new(0)) }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiving end of the [`EventBus`] that keeps count of lost events.
#[derive(Debug)]
pub struct EventSubscriber {
    rx: broadcast::Receiver<GraphEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSubscriber {
    /// Next event, skipping over any the subscriber fell behind on.
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<GraphEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let total = self.dropped.fetch_add(skipped, Ordering::Relaxed) + skipped;
                    warn!(skipped, total, "Event subscriber lagged, dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`EventSubscriber::recv`].
    pub fn try_recv(&mut self) -> Option<GraphEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(skipped, "Event subscriber lagged, dropped oldest events");
                }
                Err(_) => return None,
            }
        }
    }

    /// Events lost to lag so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
