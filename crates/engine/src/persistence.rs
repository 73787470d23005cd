//! Projects the event stream onto `workflow_executions` / `node_executions`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::models::{
    NewNodeExecution, NewWorkflowExecution, NodeExecutionStatus, NodeExecutionUpdate, WorkflowExecutionRow,
    WorkflowExecutionStatus, WorkflowExecutionUpdate,
};
use db::repository::executions;
use db::{DbError, DbPool};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EngineLayer, GraphEvent, NodeEventInfo, NodeResultData};
use crate::EngineError;

/// Run-level values that do not travel on the event stream.
#[derive(Debug, Clone)]
pub struct WorkflowMetadata {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub version: String,
    /// Graph document stored with the run.
    pub graph: Value,
}

/// Best-effort telemetry job for a finished run.
#[derive(Debug, Clone)]
pub struct TraceTask {
    pub execution: WorkflowExecutionRow,
}

pub struct PersistenceLayer {
    db: DbPool,
    run_id: Uuid,
    workflow: WorkflowMetadata,
    next_index: i64,
    /// Attempt id → when it started.
    started: HashMap<Uuid, DateTime<Utc>>,
    trace_tx: Option<mpsc::Sender<TraceTask>>,
}

impl PersistenceLayer {
    pub fn new(db: DbPool, run_id: Uuid, workflow: WorkflowMetadata) -> Self {
        Self { db, run_id, workflow, next_index: 0, started: HashMap::new(), trace_tx: None }
    }

    pub fn with_trace_queue(mut self, trace_tx: mpsc::Sender<TraceTask>) -> Self {
        self.trace_tx = Some(trace_tx);
        self
    }

    async fn handle(&mut self, event: &GraphEvent) -> Result<(), DbError> {
        match event {
            GraphEvent::RunStarted { inputs, resumed: false, .. } => {
                let new = NewWorkflowExecution {
                    id: self.run_id,
                    workflow_id: self.workflow.workflow_id,
                    workflow_type: self.workflow.workflow_type.clone(),
                    version: self.workflow.version.clone(),
                    graph: self.workflow.graph.clone(),
                    inputs: Value::Object(inputs.clone()),
                    started_at: Utc::now(),
                };
                executions::insert_workflow_execution(&self.db, &new).await?;
            }
            GraphEvent::RunStarted { resumed: true, .. } => {
                executions::resume_workflow_execution(&self.db, self.run_id).await?;
                self.next_index = executions::max_node_execution_index(&self.db, self.run_id).await?;
                debug!(run_id = %self.run_id, next_index = self.next_index, "Resumed run record");
            }

            GraphEvent::NodeStarted { info } => self.insert_node(info).await?,
            GraphEvent::NodeSucceeded { info, result } => {
                self.finish_node(info, NodeExecutionStatus::Succeeded, Some(result), None).await?
            }
            GraphEvent::NodeFailed { info, error, inputs, .. } => {
                let result = NodeResultData { inputs: inputs.clone(), ..Default::default() };
                self.finish_node(info, NodeExecutionStatus::Failed, Some(&result), Some(error)).await?
            }
            GraphEvent::NodeException { info, error, result, .. } => {
                self.finish_node(info, NodeExecutionStatus::Exception, Some(result), Some(error)).await?
            }
            GraphEvent::NodeRetry { info, error, .. } => {
                self.finish_node(info, NodeExecutionStatus::Retry, None, Some(error)).await?
            }
            GraphEvent::NodePauseRequested { info, .. } => {
                self.finish_node(info, NodeExecutionStatus::Paused, None, None).await?
            }

            GraphEvent::RunSucceeded { outputs, total_tokens, steps } => {
                self.finish_run(WorkflowExecutionStatus::Succeeded, outputs, None, *total_tokens, *steps, 0)
                    .await?;
                self.enqueue_trace().await?;
            }
            GraphEvent::RunPartialSucceeded { outputs, exceptions_count, total_tokens, steps } => {
                self.finish_run(
                    WorkflowExecutionStatus::PartialSucceeded,
                    outputs,
                    None,
                    *total_tokens,
                    *steps,
                    *exceptions_count,
                )
                .await?;
                self.enqueue_trace().await?;
            }
            GraphEvent::RunFailed { error, exceptions_count, total_tokens, steps } => {
                // Orphaned node rows are closed even when the run row cannot be written.
                let finished = self
                    .finish_run(
                        WorkflowExecutionStatus::Failed,
                        &Map::new(),
                        Some(error.clone()),
                        *total_tokens,
                        *steps,
                        *exceptions_count,
                    )
                    .await;
                self.fail_orphans(error).await?;
                finished?;
            }
            GraphEvent::RunAborted { reason, outputs, exceptions_count, total_tokens, steps } => {
                let finished = self
                    .finish_run(
                        WorkflowExecutionStatus::Stopped,
                        outputs,
                        Some(reason.clone()),
                        *total_tokens,
                        *steps,
                        *exceptions_count,
                    )
                    .await;
                self.fail_orphans(reason).await?;
                finished?;
            }
            GraphEvent::RunPaused { outputs, snapshot, exceptions_count, total_tokens, steps, .. } => {
                let update = WorkflowExecutionUpdate {
                    status: WorkflowExecutionStatus::Paused,
                    outputs: Some(Value::Object(outputs.clone())),
                    error_message: None,
                    total_tokens: *total_tokens as i64,
                    total_steps: i64::from(*steps),
                    exceptions_count: i64::from(*exceptions_count),
                    pause_snapshot: Some(snapshot.clone()),
                    finished_at: None,
                };
                executions::update_workflow_execution(&self.db, self.run_id, &update).await?;
                info!(run_id = %self.run_id, "Stored pause snapshot");
            }

            _ => {}
        }
        Ok(())
    }

    async fn insert_node(&mut self, info: &NodeEventInfo) -> Result<(), DbError> {
        self.next_index += 1;
        self.started.insert(info.execution_id, info.started_at);
        let new = NewNodeExecution {
            id: info.execution_id,
            workflow_execution_id: self.run_id,
            node_id: info.node_id.clone(),
            node_type: info.node_type.clone(),
            title: info.title.clone(),
            execution_index: self.next_index,
            predecessor_node_id: info.predecessor_node_id.clone(),
            iteration_id: info.iteration_id.clone(),
            loop_id: info.loop_id.clone(),
            created_at: info.started_at,
        };
        executions::insert_node_execution(&self.db, &new).await?;
        Ok(())
    }

    async fn finish_node(
        &mut self,
        info: &NodeEventInfo,
        status: NodeExecutionStatus,
        result: Option<&NodeResultData>,
        error: Option<&String>,
    ) -> Result<(), DbError> {
        let finished_at = Utc::now();
        // Elapsed time of this attempt, not of the run.
        let elapsed_time = self
            .started
            .remove(&info.execution_id)
            .map(|started| (finished_at - started).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();
        let update = NodeExecutionUpdate {
            status,
            inputs: result.map(|r| Value::Object(r.inputs.clone())),
            process_data: result.map(|r| Value::Object(r.process_data.clone())),
            outputs: result.map(|r| Value::Object(r.outputs.clone())),
            error: error.cloned(),
            elapsed_time,
            total_tokens: result.map(|r| r.total_tokens as i64).unwrap_or_default(),
            finished_at,
        };
        executions::finish_node_execution(&self.db, info.execution_id, &update).await
    }

    async fn finish_run(
        &self,
        status: WorkflowExecutionStatus,
        outputs: &Map<String, Value>,
        error_message: Option<String>,
        total_tokens: u64,
        steps: u32,
        exceptions_count: u32,
    ) -> Result<(), DbError> {
        let update = WorkflowExecutionUpdate {
            status,
            outputs: Some(Value::Object(outputs.clone())),
            error_message,
            total_tokens: total_tokens as i64,
            total_steps: i64::from(steps),
            exceptions_count: i64::from(exceptions_count),
            pause_snapshot: None,
            finished_at: Some(Utc::now()),
        };
        executions::update_workflow_execution(&self.db, self.run_id, &update).await?;
        info!(run_id = %self.run_id, %status, "Run record finalised");
        Ok(())
    }

    async fn fail_orphans(&self, error: &str) -> Result<(), DbError> {
        let touched = executions::fail_running_node_executions(&self.db, self.run_id, error, Utc::now()).await?;
        if touched > 0 {
            warn!(run_id = %self.run_id, touched, "Marked still-running node executions as failed");
        }
        Ok(())
    }

    async fn enqueue_trace(&self) -> Result<(), DbError> {
        let Some(trace_tx) = &self.trace_tx else { return Ok(()) };
        let execution = executions::get_workflow_execution(&self.db, self.run_id).await?;
        if let Err(e) = trace_tx.try_send(TraceTask { execution }) {
            warn!(run_id = %self.run_id, error = %e, "Trace queue unavailable, dropping trace task");
        }
        Ok(())
    }
}

#[async_trait]
impl EngineLayer for PersistenceLayer {
    async fn on_event(&mut self, event: &GraphEvent) -> Result<(), EngineError> {
        self.handle(event).await.map_err(EngineError::from)
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use db::pool::create_memory_pool;
    use serde_json::json;

    fn metadata() -> WorkflowMetadata {
        WorkflowMetadata {
            workflow_id: Uuid::new_v4(),
            workflow_type: "workflow".into(),
            version: "draft".into(),
            graph: json!({"nodes": [], "edges": []}),
        }
    }

    fn info(node_id: &str) -> NodeEventInfo {
        NodeEventInfo {
            execution_id: Uuid::new_v4(),
            node_id: node_id.into(),
            node_type: "tool".into(),
            title: node_id.into(),
            predecessor_node_id: Some("start".into()),
            iteration_id: None,
            loop_id: None,
            container_index: None,
            started_at: Utc::now(),
        }
    }

    fn run_started(run_id: Uuid, resumed: bool) -> GraphEvent {
        GraphEvent::RunStarted { run_id, workflow_id: Uuid::new_v4(), inputs: Map::new(), resumed }
    }

    #[tokio::test]
    async fn every_attempt_gets_its_own_row_and_index() {
        let db = create_memory_pool().await.unwrap();
        let run_id = Uuid::new_v4();
        let mut layer = PersistenceLayer::new(db.clone(), run_id, metadata());

        let first = info("tool");
        let second = info("tool");
        let events = [
            run_started(run_id, false),
            GraphEvent::NodeStarted { info: first.clone() },
            GraphEvent::NodeRetry { info: first, error: "timeout".into(), retry_index: 0 },
            GraphEvent::NodeStarted { info: second.clone() },
            GraphEvent::NodeSucceeded {
                info: second,
                result: NodeResultData { total_tokens: 12, ..Default::default() },
            },
            GraphEvent::RunSucceeded { outputs: Map::new(), total_tokens: 12, steps: 2 },
        ];
        for event in &events {
            layer.on_event(event).await.unwrap();
        }

        let rows = executions::list_node_executions(&db, run_id).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.execution_index).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(rows[0].status, "retry");
        assert_eq!(rows[0].error.as_deref(), Some("timeout"));
        assert_eq!(rows[1].status, "succeeded");
        assert_eq!(rows[1].total_tokens, 12);

        let run = executions::get_workflow_execution(&db, run_id).await.unwrap();
        assert_eq!(run.status().unwrap(), WorkflowExecutionStatus::Succeeded);
        assert_eq!(run.total_tokens, 12);
    }

    #[tokio::test]
    async fn resumed_runs_continue_the_index_sequence() {
        let db = create_memory_pool().await.unwrap();
        let run_id = Uuid::new_v4();

        let mut first = PersistenceLayer::new(db.clone(), run_id, metadata());
        let ask = info("ask");
        first.on_event(&run_started(run_id, false)).await.unwrap();
        first.on_event(&GraphEvent::NodeStarted { info: ask.clone() }).await.unwrap();
        first.on_event(&GraphEvent::NodePauseRequested { info: ask, reason: "approve?".into() }).await.unwrap();
        first
            .on_event(&GraphEvent::RunPaused {
                outputs: Map::new(),
                paused_node_ids: vec!["ask".into()],
                snapshot: "{}".into(),
                exceptions_count: 1,
                total_tokens: 0,
                steps: 1,
            })
            .await
            .unwrap();
        let run = executions::get_workflow_execution(&db, run_id).await.unwrap();
        assert_eq!(run.status().unwrap(), WorkflowExecutionStatus::Paused);
        assert_eq!(run.exceptions_count, 1);
        assert!(run.finished_at.is_none());

        let mut second = PersistenceLayer::new(db.clone(), run_id, metadata());
        second.on_event(&run_started(run_id, true)).await.unwrap();
        second.on_event(&GraphEvent::NodeStarted { info: info("ask") }).await.unwrap();

        let rows = executions::list_node_executions(&db, run_id).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.execution_index).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(rows[0].status, "paused");
        let run = executions::get_workflow_execution(&db, run_id).await.unwrap();
        assert_eq!(run.status().unwrap(), WorkflowExecutionStatus::Running);
        assert!(run.pause_snapshot.is_none());
    }

    #[tokio::test]
    async fn failed_runs_close_attempts_left_running() {
        let db = create_memory_pool().await.unwrap();
        let run_id = Uuid::new_v4();
        let mut layer = PersistenceLayer::new(db.clone(), run_id, metadata());

        layer.on_event(&run_started(run_id, false)).await.unwrap();
        layer.on_event(&GraphEvent::NodeStarted { info: info("slow") }).await.unwrap();
        layer
            .on_event(&GraphEvent::RunFailed {
                error: "node 'other' failed".into(),
                exceptions_count: 0,
                total_tokens: 0,
                steps: 2,
            })
            .await
            .unwrap();

        let rows = executions::list_node_executions(&db, run_id).await.unwrap();
        assert_eq!(rows[0].status, "failed");
        assert_eq!(rows[0].error.as_deref(), Some("node 'other' failed"));
        assert!(rows[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn aborted_runs_keep_their_exception_count() {
        let db = create_memory_pool().await.unwrap();
        let run_id = Uuid::new_v4();
        let mut layer = PersistenceLayer::new(db.clone(), run_id, metadata());

        layer.on_event(&run_started(run_id, false)).await.unwrap();
        layer
            .on_event(&GraphEvent::RunAborted {
                reason: "stopped by user".into(),
                outputs: Map::new(),
                exceptions_count: 2,
                total_tokens: 0,
                steps: 3,
            })
            .await
            .unwrap();

        let run = executions::get_workflow_execution(&db, run_id).await.unwrap();
        assert_eq!(run.status().unwrap(), WorkflowExecutionStatus::Stopped);
        assert_eq!(run.exceptions_count, 2);
        assert_eq!(run.error_message.as_deref(), Some("stopped by user"));
    }

    #[tokio::test]
    async fn running_attempts_are_closed_even_if_the_run_row_cannot_be_written() {
        let db = create_memory_pool().await.unwrap();
        let run_id = Uuid::new_v4();
        let mut layer = PersistenceLayer::new(db.clone(), run_id, metadata());

        layer.on_event(&run_started(run_id, false)).await.unwrap();
        layer.on_event(&GraphEvent::NodeStarted { info: info("slow") }).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_run_update BEFORE UPDATE ON workflow_executions \
             BEGIN SELECT RAISE(ABORT, 'run row is read-only'); END;",
        )
        .execute(&db)
        .await
        .unwrap();

        let result = layer
            .on_event(&GraphEvent::RunFailed {
                error: "node 'other' failed".into(),
                exceptions_count: 0,
                total_tokens: 0,
                steps: 2,
            })
            .await;
        assert!(result.is_err());

        let rows = executions::list_node_executions(&db, run_id).await.unwrap();
        assert_eq!(rows[0].status, "failed");
        assert!(rows[0].finished_at.is_some());
    }
}
