//! Workflow definitions as they arrive from the outside.
//!
//! A graph document is plain JSON; [`crate::dag::validate_dag`] turns it
//! into a compiled [`crate::dag::Graph`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Handle carried by ordinary (non-branch) edges.
pub const DEFAULT_SOURCE_HANDLE: &str = "source";
/// Handle of the edges a `fail-branch` node routes to on failure.
pub const FAIL_BRANCH_HANDLE: &str = "fail-branch";

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Container (iteration / loop) this node belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Node settings, tagged by `type`. Parsed during validation.
    pub data: Value,
}

// ---------------------------------------------------------------------------
// EdgeConfig
// ---------------------------------------------------------------------------

fn default_source_handle() -> String {
    DEFAULT_SOURCE_HANDLE.to_string()
}

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub id: String,
    pub source: String,
    #[serde(default = "default_source_handle")]
    pub source_handle: String,
    pub target: String,
}

impl EdgeConfig {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_handle(source, DEFAULT_SOURCE_HANDLE, target)
    }

    pub fn with_handle(source: impl Into<String>, handle: impl Into<String>, target: impl Into<String>) -> Self {
        Self { id: String::new(), source: source.into(), source_handle: handle.into(), target: target.into() }
    }
}

// ---------------------------------------------------------------------------
// GraphConfig / Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphConfig {
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_workflow_type")]
    pub workflow_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub graph: GraphConfig,
    /// Operator-configured values seeded into the read-only `env` scope.
    #[serde(default)]
    pub environment_variables: BTreeMap<String, Value>,
    /// Initial values of the `conversation` scope.
    #[serde(default)]
    pub conversation_variables: BTreeMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_workflow_type() -> String {
    "workflow".to_string()
}

fn default_version() -> String {
    "draft".to_string()
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, graph: GraphConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            workflow_type: default_workflow_type(),
            version: default_version(),
            graph,
            environment_variables: BTreeMap::new(),
            conversation_variables: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}
