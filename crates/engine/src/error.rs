//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the workflow engine (validation, input mapping, resume).
///
/// Node failures are not engine errors: they are handled by the node's
/// error strategy and end up in the run status.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    #[error("workflow graph has no nodes")]
    EmptyGraph,

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in its graph.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    #[error("{graph} has no start node")]
    MissingStartNode { graph: String },

    #[error("{graph} has more than one start node")]
    MultipleStartNodes { graph: String },

    #[error("node '{0}' is not reachable from the start node")]
    UnreachableNode(String),

    #[error("node '{node_id}' has an invalid configuration: {message}")]
    InvalidNodeConfig {
        node_id: String,
        message: String,
    },

    // ------ Input mapping errors ------

    #[error("variable key '{0}' not found in user inputs")]
    MissingVariable(String),

    #[error("invalid value for '{variable}': {message}")]
    InvalidInput {
        variable: String,
        message: String,
    },

    // ------ Resume errors ------

    #[error("pause snapshot is corrupt: {0}")]
    CorruptSnapshot(String),

    #[error("workflow run {0} is not paused")]
    NotPaused(Uuid),

    // ------ Collaborators ------

    #[error("event layer failed: {0}")]
    Layer(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}
