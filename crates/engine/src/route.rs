//! Route runtime state: what actually happened during a run.
//!
//! One [`RouteNodeState`] per node attempt (append-only; retries add a new
//! record) plus the resolved state of every edge.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::{edge_matches, GraphEdge};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    Unknown,
    Taken,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteNodeStatus {
    Running,
    Succeeded,
    Failed,
    /// Failed, but handled by a non-terminating error strategy.
    Exception,
    /// Failed and superseded by a new attempt.
    Retry,
    Paused,
}

impl RouteNodeStatus {
    /// The attempt completed and its outputs are in the pool.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exception)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteNodeState {
    /// Attempt id; doubles as the node execution id.
    pub id: Uuid,
    pub node_id: String,
    pub status: RouteNodeStatus,
    /// Handle the attempt activated; `None` when it activated no edge.
    pub taken_handle: Option<String>,
    pub predecessor_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Zero-based retry counter.
    pub retry_index: u32,
}

impl RouteNodeState {
    /// Did this attempt activate `edge`?
    pub fn activated(&self, edge: &GraphEdge) -> bool {
        self.status.is_finished() && edge_matches(edge, self.taken_handle.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteState {
    attempts: Vec<RouteNodeState>,
    /// Index-aligned with the graph's edge list.
    edges: Vec<EdgeState>,
    #[serde(skip)]
    by_id: HashMap<Uuid, usize>,
}

impl PartialEq for RouteState {
    fn eq(&self, other: &Self) -> bool {
        self.attempts == other.attempts && self.edges == other.edges
    }
}

impl RouteState {
    pub fn new(edge_count: usize) -> Self {
        Self { attempts: Vec::new(), edges: vec![EdgeState::Unknown; edge_count], by_id: HashMap::new() }
    }

    /// Rebuild lookup indexes after deserialisation.
    pub(crate) fn reindex(&mut self) {
        self.by_id = self.attempts.iter().enumerate().map(|(i, a)| (a.id, i)).collect();
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn start_attempt(&mut self, node_id: &str, predecessor: Option<String>, retry_index: u32) -> Uuid {
        let id = Uuid::new_v4();
        self.by_id.insert(id, self.attempts.len());
        self.attempts.push(RouteNodeState {
            id,
            node_id: node_id.to_string(),
            status: RouteNodeStatus::Running,
            taken_handle: None,
            predecessor_node_id: predecessor,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            retry_index,
        });
        id
    }

    pub fn finish_attempt(
        &mut self,
        id: Uuid,
        status: RouteNodeStatus,
        taken_handle: Option<String>,
        error: Option<String>,
    ) {
        if let Some(&index) = self.by_id.get(&id) {
            let attempt = &mut self.attempts[index];
            attempt.status = status;
            attempt.taken_handle = taken_handle;
            attempt.error = error;
            attempt.finished_at = Some(Utc::now());
        }
    }

    pub fn attempt(&self, id: Uuid) -> Option<&RouteNodeState> {
        self.by_id.get(&id).map(|&i| &self.attempts[i])
    }

    pub fn attempts(&self) -> &[RouteNodeState] {
        &self.attempts
    }

    /// Most recent attempt of a node.
    pub fn latest(&self, node_id: &str) -> Option<&RouteNodeState> {
        self.attempts.iter().rev().find(|a| a.node_id == node_id)
    }

    /// The finished attempt of a node, if any.
    pub fn finished(&self, node_id: &str) -> Option<&RouteNodeState> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.node_id == node_id && a.status.is_finished())
    }

    pub fn edge_state(&self, index: usize) -> EdgeState {
        self.edges.get(index).copied().unwrap_or(EdgeState::Unknown)
    }

    pub fn set_edge_state(&mut self, index: usize, state: EdgeState) {
        if let Some(slot) = self.edges.get_mut(index) {
            *slot = state;
        }
    }
}
