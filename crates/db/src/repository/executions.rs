//! Execution and node-execution repository functions.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use crate::{
    models::{
        NewNodeExecution, NewWorkflowExecution, NodeExecutionRow, NodeExecutionStatus, NodeExecutionUpdate,
        WorkflowExecutionRow, WorkflowExecutionStatus, WorkflowExecutionUpdate,
    },
    DbError, DbPool,
};

const WORKFLOW_EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_type, version, graph, inputs, outputs, \
     status, error_message, total_tokens, total_steps, exceptions_count, pause_snapshot, started_at, finished_at";

const NODE_EXECUTION_COLUMNS: &str = "id, workflow_execution_id, node_id, node_type, title, execution_index, \
     predecessor_node_id, status, inputs, process_data, outputs, error, elapsed_time, total_tokens, \
     iteration_id, loop_id, created_at, finished_at";

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

/// Create a new workflow execution record in `running` status.
pub async fn insert_workflow_execution(
    pool: &DbPool,
    new: &NewWorkflowExecution,
) -> Result<WorkflowExecutionRow, DbError> {
    let sql = format!(
        "INSERT INTO workflow_executions (id, workflow_id, workflow_type, version, graph, inputs, status, started_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {WORKFLOW_EXECUTION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
        .bind(new.id)
        .bind(new.workflow_id)
        .bind(&new.workflow_type)
        .bind(&new.version)
        .bind(Json(&new.graph))
        .bind(Json(&new.inputs))
        .bind(WorkflowExecutionStatus::Running.to_string())
        .bind(new.started_at)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn get_workflow_execution(pool: &DbPool, id: Uuid) -> Result<WorkflowExecutionRow, DbError> {
    let sql = format!("SELECT {WORKFLOW_EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?");
    sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Flip a paused run back to `running`; the stored snapshot is cleared.
pub async fn resume_workflow_execution(pool: &DbPool, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE workflow_executions SET status = ?, pause_snapshot = NULL, finished_at = NULL WHERE id = ?",
    )
    .bind(WorkflowExecutionStatus::Running.to_string())
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Write terminal or paused totals.
pub async fn update_workflow_execution(
    pool: &DbPool,
    id: Uuid,
    update: &WorkflowExecutionUpdate,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_executions
        SET status = ?, outputs = ?, error_message = ?, total_tokens = ?, total_steps = ?,
            exceptions_count = ?, pause_snapshot = ?, finished_at = ?
        WHERE id = ?
        "#,
    )
    .bind(update.status.to_string())
    .bind(update.outputs.as_ref().map(Json))
    .bind(&update.error_message)
    .bind(update.total_tokens)
    .bind(update.total_steps)
    .bind(update.exceptions_count)
    .bind(&update.pause_snapshot)
    .bind(update.finished_at)
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

/// Insert a node attempt in `running` status.
pub async fn insert_node_execution(pool: &DbPool, new: &NewNodeExecution) -> Result<NodeExecutionRow, DbError> {
    let sql = format!(
        "INSERT INTO node_executions \
            (id, workflow_execution_id, node_id, node_type, title, execution_index, predecessor_node_id, \
             status, iteration_id, loop_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {NODE_EXECUTION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, NodeExecutionRow>(&sql)
        .bind(new.id)
        .bind(new.workflow_execution_id)
        .bind(&new.node_id)
        .bind(&new.node_type)
        .bind(&new.title)
        .bind(new.execution_index)
        .bind(&new.predecessor_node_id)
        .bind(NodeExecutionStatus::Running.to_string())
        .bind(&new.iteration_id)
        .bind(&new.loop_id)
        .bind(new.created_at)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn finish_node_execution(pool: &DbPool, id: Uuid, update: &NodeExecutionUpdate) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE node_executions
        SET status = ?, inputs = ?, process_data = ?, outputs = ?, error = ?,
            elapsed_time = ?, total_tokens = ?, finished_at = ?
        WHERE id = ?
        "#,
    )
    .bind(update.status.to_string())
    .bind(update.inputs.as_ref().map(Json))
    .bind(update.process_data.as_ref().map(Json))
    .bind(update.outputs.as_ref().map(Json))
    .bind(&update.error)
    .bind(update.elapsed_time)
    .bind(update.total_tokens)
    .bind(update.finished_at)
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Mark every still-running attempt of a run as failed. Returns the number
/// of rows touched.
pub async fn fail_running_node_executions(
    pool: &DbPool,
    workflow_execution_id: Uuid,
    error: &str,
    finished_at: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE node_executions SET status = ?, error = ?, finished_at = ? \
         WHERE workflow_execution_id = ? AND status = ?",
    )
    .bind(NodeExecutionStatus::Failed.to_string())
    .bind(error)
    .bind(finished_at)
    .bind(workflow_execution_id)
    .bind(NodeExecutionStatus::Running.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Highest `execution_index` recorded for a run, `0` when none.
pub async fn max_node_execution_index(pool: &DbPool, workflow_execution_id: Uuid) -> Result<i64, DbError> {
    let max: Option<i64> =
        sqlx::query_scalar("SELECT MAX(execution_index) FROM node_executions WHERE workflow_execution_id = ?")
            .bind(workflow_execution_id)
            .fetch_one(pool)
            .await?;
    Ok(max.unwrap_or(0))
}

/// All attempts of a run in display order.
pub async fn list_node_executions(
    pool: &DbPool,
    workflow_execution_id: Uuid,
) -> Result<Vec<NodeExecutionRow>, DbError> {
    let sql = format!(
        "SELECT {NODE_EXECUTION_COLUMNS} FROM node_executions \
         WHERE workflow_execution_id = ? ORDER BY execution_index"
    );
    let rows = sqlx::query_as::<_, NodeExecutionRow>(&sql)
        .bind(workflow_execution_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::create_memory_pool;
    use serde_json::json;

    fn new_run() -> NewWorkflowExecution {
        NewWorkflowExecution {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            workflow_type: "workflow".into(),
            version: "1".into(),
            graph: json!({"nodes": [], "edges": []}),
            inputs: json!({"x": 1}),
            started_at: Utc::now(),
        }
    }

    fn new_node(run: Uuid, node_id: &str, index: i64) -> NewNodeExecution {
        NewNodeExecution {
            id: Uuid::new_v4(),
            workflow_execution_id: run,
            node_id: node_id.into(),
            node_type: "llm".into(),
            title: node_id.into(),
            execution_index: index,
            predecessor_node_id: None,
            iteration_id: None,
            loop_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn run_row_round_trips_json_columns() {
        let pool = create_memory_pool().await.unwrap();
        let new = new_run();
        let row = insert_workflow_execution(&pool, &new).await.unwrap();
        assert_eq!(row.status().unwrap(), WorkflowExecutionStatus::Running);
        assert_eq!(row.inputs.0, json!({"x": 1}));

        update_workflow_execution(
            &pool,
            new.id,
            &WorkflowExecutionUpdate {
                status: WorkflowExecutionStatus::Paused,
                outputs: Some(json!({})),
                error_message: None,
                total_tokens: 5,
                total_steps: 2,
                exceptions_count: 0,
                pause_snapshot: Some("{}".into()),
                finished_at: None,
            },
        )
        .await
        .unwrap();

        let stored = get_workflow_execution(&pool, new.id).await.unwrap();
        assert_eq!(stored.status().unwrap(), WorkflowExecutionStatus::Paused);
        assert_eq!(stored.pause_snapshot.as_deref(), Some("{}"));

        resume_workflow_execution(&pool, new.id).await.unwrap();
        let stored = get_workflow_execution(&pool, new.id).await.unwrap();
        assert_eq!(stored.status().unwrap(), WorkflowExecutionStatus::Running);
        assert!(stored.pause_snapshot.is_none());
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let pool = create_memory_pool().await.unwrap();
        assert!(matches!(get_workflow_execution(&pool, Uuid::new_v4()).await, Err(DbError::NotFound)));
    }

    #[tokio::test]
    async fn orphaned_running_nodes_are_failed() {
        let pool = create_memory_pool().await.unwrap();
        let run = new_run();
        insert_workflow_execution(&pool, &run).await.unwrap();

        let done = new_node(run.id, "a", 1);
        insert_node_execution(&pool, &done).await.unwrap();
        insert_node_execution(&pool, &new_node(run.id, "b", 2)).await.unwrap();
        finish_node_execution(
            &pool,
            done.id,
            &NodeExecutionUpdate {
                status: NodeExecutionStatus::Succeeded,
                inputs: None,
                process_data: None,
                outputs: Some(json!({"text": "hi"})),
                error: None,
                elapsed_time: 0.5,
                total_tokens: 3,
                finished_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let touched = fail_running_node_executions(&pool, run.id, "run aborted", Utc::now()).await.unwrap();
        assert_eq!(touched, 1);
        assert_eq!(max_node_execution_index(&pool, run.id).await.unwrap(), 2);

        let rows = list_node_executions(&pool, run.id).await.unwrap();
        let statuses: Vec<_> = rows.iter().map(|r| r.status().unwrap()).collect();
        assert_eq!(statuses, vec![NodeExecutionStatus::Succeeded, NodeExecutionStatus::Failed]);
        assert_eq!(rows[1].error.as_deref(), Some("run aborted"));
    }
}
