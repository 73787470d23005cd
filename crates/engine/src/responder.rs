//! Streaming responder: turns the event stream into answer text chunks for
//! a client.
//!
//! Chunks the engine marked safe go out immediately. The rest are held per
//! node attempt and released when the run ends, and only for attempts that
//! succeeded.

use std::collections::{HashMap, HashSet};

use nodes::Selector;
use uuid::Uuid;

use crate::events::GraphEvent;

/// One piece of answer text ready for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutput {
    /// Node that produced the text.
    pub node_id: String,
    pub selector: Selector,
    pub chunk: String,
    /// Answer node the text belongs to; `None` for flushed buffers.
    pub sink_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct AnswerStreamResponder {
    buffers: HashMap<Uuid, Vec<StreamOutput>>,
    /// Buffer order, so flushes follow arrival order.
    order: Vec<Uuid>,
    succeeded: HashSet<Uuid>,
}

impl AnswerStreamResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: &GraphEvent) -> Vec<StreamOutput> {
        match event {
            GraphEvent::NodeStreamChunk { info, selector, chunk, sinks, safe_sinks } => {
                // No answer renders this selector.
                if sinks.is_empty() {
                    return Vec::new();
                }
                let current = StreamOutput {
                    node_id: info.node_id.clone(),
                    selector: selector.clone(),
                    chunk: chunk.clone(),
                    sink_id: None,
                };
                if safe_sinks.is_empty() {
                    if !self.buffers.contains_key(&info.execution_id) {
                        self.order.push(info.execution_id);
                    }
                    self.buffers.entry(info.execution_id).or_default().push(current);
                    return Vec::new();
                }

                // Chunks this attempt had to hold back precede the current one.
                let mut pending = match self.buffers.remove(&info.execution_id) {
                    Some(held) => {
                        self.order.retain(|id| *id != info.execution_id);
                        held
                    }
                    None => Vec::new(),
                };
                pending.push(current);
                pending
                    .iter()
                    .flat_map(|output| {
                        safe_sinks.iter().map(move |sink| StreamOutput { sink_id: Some(sink.clone()), ..output.clone() })
                    })
                    .collect()
            }
            GraphEvent::NodeSucceeded { info, .. } => {
                self.succeeded.insert(info.execution_id);
                Vec::new()
            }
            GraphEvent::NodeFailed { info, .. }
            | GraphEvent::NodeException { info, .. }
            | GraphEvent::NodeRetry { info, .. } => {
                self.buffers.remove(&info.execution_id);
                Vec::new()
            }
            event if event.is_run_terminal() => self.flush(),
            _ => Vec::new(),
        }
    }

    /// Number of attempts with held-back chunks.
    pub fn buffered(&self) -> usize {
        self.buffers.len()
    }

    fn flush(&mut self) -> Vec<StreamOutput> {
        let mut out = Vec::new();
        for id in std::mem::take(&mut self.order) {
            let Some(chunks) = self.buffers.remove(&id) else { continue };
            if self.succeeded.contains(&id) {
                out.extend(chunks);
            }
        }
        self.buffers.clear();
        out
    }
}
