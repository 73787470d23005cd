//! Pause snapshots: everything needed to rebuild a paused control loop.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dag::Graph;
use crate::graph_engine::ReadyNode;
use crate::pool::VariablePool;
use crate::route::RouteState;
use crate::EngineError;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseSnapshot {
    pub version: u32,
    pub pool: VariablePool,
    pub route: RouteState,
    /// Nodes that were ready but not yet dispatched.
    pub ready: Vec<ReadyNode>,
    /// Nodes that requested the pause; re-run with the resume payload.
    pub paused_node_ids: Vec<String>,
    pub outputs: Map<String, Value>,
    pub exceptions_count: u32,
    pub steps: u32,
    pub total_tokens: u64,
    pub dispatched: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
}

impl PauseSnapshot {
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::CorruptSnapshot(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        let mut snapshot: PauseSnapshot =
            serde_json::from_str(raw).map_err(|e| EngineError::CorruptSnapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::CorruptSnapshot(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        snapshot.route.reindex();
        Ok(snapshot)
    }

    /// Reject snapshots taken from a different graph.
    pub fn check_against(&self, graph: &Graph) -> Result<(), EngineError> {
        if self.route.edge_count() != graph.edges().len() {
            return Err(EngineError::CorruptSnapshot(format!(
                "snapshot tracks {} edges, graph has {}",
                self.route.edge_count(),
                graph.edges().len()
            )));
        }
        let unknown = self
            .ready
            .iter()
            .map(|r| r.node_id.as_str())
            .chain(self.paused_node_ids.iter().map(String::as_str))
            .chain(self.route.attempts().iter().map(|a| a.node_id.as_str()))
            .find(|id| graph.node(id).is_none());
        if let Some(id) = unknown {
            return Err(EngineError::CorruptSnapshot(format!("unknown node '{id}'")));
        }
        Ok(())
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::validate_dag;
    use crate::models::{EdgeConfig, GraphConfig, NodeConfig};
    use crate::pool::SystemVariables;
    use serde_json::json;

    fn snapshot(edge_count: usize) -> PauseSnapshot {
        let mut route = RouteState::new(edge_count);
        route.start_attempt("start", None, 0);
        PauseSnapshot {
            version: SNAPSHOT_VERSION,
            pool: VariablePool::new(SystemVariables::default(), Default::default(), Default::default()),
            route,
            ready: vec![ReadyNode { node_id: "ask".into(), predecessor: Some("start".into()) }],
            paused_node_ids: Vec::new(),
            outputs: Map::new(),
            exceptions_count: 0,
            steps: 1,
            total_tokens: 0,
            dispatched: BTreeSet::from(["start".to_string(), "ask".to_string()]),
            skipped: BTreeSet::new(),
        }
    }

    #[test]
    fn json_round_trip_restores_attempt_lookup() {
        let original = snapshot(1);
        let id = original.route.attempts()[0].id;
        let decoded = PauseSnapshot::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.route.attempt(id).is_some());
    }

    #[test]
    fn garbage_and_wrong_versions_are_corrupt() {
        assert!(matches!(PauseSnapshot::from_json("{not json"), Err(EngineError::CorruptSnapshot(_))));

        let mut value = serde_json::to_value(snapshot(1)).unwrap();
        value["version"] = json!(99);
        let err = PauseSnapshot::from_json(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn snapshot_must_match_the_graph() {
        let graph = validate_dag(&GraphConfig {
            nodes: vec![
                NodeConfig { id: "start".into(), parent_id: None, data: json!({"type": "start"}) },
                NodeConfig { id: "ask".into(), parent_id: None, data: json!({"type": "human-input"}) },
            ],
            edges: vec![EdgeConfig::new("start", "ask")],
        })
        .unwrap();

        assert!(snapshot(1).check_against(&graph).is_ok());
        assert!(snapshot(3).check_against(&graph).is_err());

        let mut stray = snapshot(1);
        stray.paused_node_ids.push("ghost".into());
        assert!(matches!(stray.check_against(&graph), Err(EngineError::CorruptSnapshot(m)) if m.contains("ghost")));
    }
}
