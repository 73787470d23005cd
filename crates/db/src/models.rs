//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models; they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

/// Possible statuses for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowExecutionStatus {
    Running,
    Succeeded,
    PartialSucceeded,
    Failed,
    Stopped,
    Paused,
}

impl std::fmt::Display for WorkflowExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::PartialSucceeded => write!(f, "partial_succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for WorkflowExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running"           => Ok(Self::Running),
            "succeeded"         => Ok(Self::Succeeded),
            "partial_succeeded" => Ok(Self::PartialSucceeded),
            "failed"            => Ok(Self::Failed),
            "stopped"           => Ok(Self::Stopped),
            "paused"            => Ok(Self::Paused),
            other               => Err(format!("unknown workflow execution status: {other}")),
        }
    }
}

/// A persisted workflow execution row.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub version: String,
    /// Graph document the run was started with.
    pub graph: Json<Value>,
    pub inputs: Json<Value>,
    pub outputs: Option<Json<Value>>,
    pub status: String,
    pub error_message: Option<String>,
    pub total_tokens: i64,
    pub total_steps: i64,
    pub exceptions_count: i64,
    /// Serialized engine state while the run is paused.
    pub pause_snapshot: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecutionRow {
    pub fn status(&self) -> Result<WorkflowExecutionStatus, String> {
        self.status.parse()
    }
}

/// Values for a new `workflow_executions` row.
#[derive(Debug, Clone)]
pub struct NewWorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub version: String,
    pub graph: Value,
    pub inputs: Value,
    pub started_at: DateTime<Utc>,
}

/// Terminal (or paused) totals written back to a run.
#[derive(Debug, Clone)]
pub struct WorkflowExecutionUpdate {
    pub status: WorkflowExecutionStatus,
    pub outputs: Option<Value>,
    pub error_message: Option<String>,
    pub total_tokens: i64,
    pub total_steps: i64,
    pub exceptions_count: i64,
    pub pause_snapshot: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

/// Possible statuses for a node attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Exception,
    Retry,
    Paused,
}

impl std::fmt::Display for NodeExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Exception => write!(f, "exception"),
            Self::Retry => write!(f, "retry"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for NodeExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running"   => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed"    => Ok(Self::Failed),
            "exception" => Ok(Self::Exception),
            "retry"     => Ok(Self::Retry),
            "paused"    => Ok(Self::Paused),
            other       => Err(format!("unknown node execution status: {other}")),
        }
    }
}

/// A persisted node execution row.
#[derive(Debug, Clone, FromRow)]
pub struct NodeExecutionRow {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub title: String,
    /// Per-run display order.
    pub execution_index: i64,
    pub predecessor_node_id: Option<String>,
    pub status: String,
    pub inputs: Option<Json<Value>>,
    pub process_data: Option<Json<Value>>,
    pub outputs: Option<Json<Value>>,
    pub error: Option<String>,
    /// Seconds spent in this attempt.
    pub elapsed_time: f64,
    pub total_tokens: i64,
    pub iteration_id: Option<String>,
    pub loop_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecutionRow {
    pub fn status(&self) -> Result<NodeExecutionStatus, String> {
        self.status.parse()
    }
}

#[derive(Debug, Clone)]
pub struct NewNodeExecution {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub title: String,
    pub execution_index: i64,
    pub predecessor_node_id: Option<String>,
    pub iteration_id: Option<String>,
    pub loop_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NodeExecutionUpdate {
    pub status: NodeExecutionStatus,
    pub inputs: Option<Value>,
    pub process_data: Option<Value>,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub elapsed_time: f64,
    pub total_tokens: i64,
    pub finished_at: DateTime<Utc>,
}
