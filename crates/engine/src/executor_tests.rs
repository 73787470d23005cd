//! End-to-end tests for the workflow executor.
//!
//! Every test runs real graphs against an in-memory SQLite database, with
//! the scripted doubles from `nodes::mock` standing in for models, tools
//! and code sandboxes.

use std::sync::Arc;
use std::time::Duration;

use db::models::{WorkflowExecutionStatus, WorkflowExecutionUpdate};
use db::pool::create_memory_pool;
use db::repository::executions;
use db::DbPool;
use nodes::mock::{MockCodeExecutor, MockTool, ScriptedModel};
use nodes::NodeServices;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::GraphEvent;
use crate::executor::{ExecutorConfig, RunRequest, WorkflowExecutor};
use crate::graph_engine::RunStatus;
use crate::models::{EdgeConfig, GraphConfig, NodeConfig, Workflow};
use crate::responder::AnswerStreamResponder;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn node(id: &str, data: Value) -> NodeConfig {
    NodeConfig { id: id.into(), parent_id: None, data }
}

fn child(id: &str, parent: &str, data: Value) -> NodeConfig {
    NodeConfig { id: id.into(), parent_id: Some(parent.into()), data }
}

fn start(variables: Value) -> NodeConfig {
    node("s", json!({"type": "start", "variables": variables}))
}

fn tpl(id: &str, template: &str, variables: Value) -> NodeConfig {
    node(id, json!({"type": "template-transform", "template": template, "variables": variables}))
}

fn end(outputs: Value) -> NodeConfig {
    node("end", json!({"type": "end", "outputs": outputs}))
}

/// ids[0] → ids[1] → … → ids[n-1]
fn chain(ids: &[&str]) -> Vec<EdgeConfig> {
    ids.windows(2).map(|w| EdgeConfig::new(w[0], w[1])).collect()
}

fn workflow(nodes: Vec<NodeConfig>, edges: Vec<EdgeConfig>) -> Workflow {
    Workflow::new("test", GraphConfig { nodes, edges })
}

fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn test_config() -> ExecutorConfig {
    ExecutorConfig { retry_base_delay: Duration::from_millis(1), ..ExecutorConfig::default() }
}

async fn setup() -> (DbPool, WorkflowExecutor) {
    let pool = create_memory_pool().await.expect("memory pool");
    let executor = WorkflowExecutor::new(pool.clone(), test_config());
    (pool, executor)
}

/// `(node_id, status)` per persisted attempt, in execution order.
async fn attempts(pool: &DbPool, run_id: Uuid) -> Vec<(String, String)> {
    executions::list_node_executions(pool, run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.node_id, r.status))
        .collect()
}

fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
    expected.iter().map(|(n, s)| (n.to_string(), s.to_string())).collect()
}

async fn run_status(pool: &DbPool, run_id: Uuid) -> WorkflowExecutionStatus {
    executions::get_workflow_execution(pool, run_id).await.unwrap().status().unwrap()
}

// ============================================================
// Ordering and routing
// ============================================================

#[tokio::test]
async fn linear_workflow_runs_in_topological_order() {
    let (pool, executor) = setup().await;
    let wf = workflow(
        vec![
            start(json!([{"variable": "name"}])),
            tpl("a", "hello {{ n }}", json!([{"variable": "n", "value_selector": ["s", "name"]}])),
            tpl("b", "{{ g }}!", json!([{"variable": "g", "value_selector": ["a", "output"]}])),
            end(json!([{"variable": "greeting", "value_selector": ["b", "output"]}])),
        ],
        chain(&["s", "a", "b", "end"]),
    );

    let result = executor.run(&wf, RunRequest::new(inputs(json!({"name": "ada"})))).await.unwrap();

    assert_eq!(result.outcome.status, RunStatus::Succeeded);
    assert_eq!(result.outcome.outputs["greeting"], json!("hello ada!"));
    assert_eq!(result.outcome.steps, 4);

    let rows = executions::list_node_executions(&pool, result.execution_id).await.unwrap();
    let order: Vec<_> = rows.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(order, ["s", "a", "b", "end"]);
    assert_eq!(rows.iter().map(|r| r.execution_index).collect::<Vec<_>>(), [1, 2, 3, 4]);
    assert_eq!(rows[1].predecessor_node_id.as_deref(), Some("s"));

    let run = executions::get_workflow_execution(&pool, result.execution_id).await.unwrap();
    assert_eq!(run.status().unwrap(), WorkflowExecutionStatus::Succeeded);
    assert_eq!(run.total_steps, 4);
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn parallel_branches_join_before_the_end_node() {
    let (pool, executor) = setup().await;
    let wf = workflow(
        vec![
            start(json!([])),
            tpl("left", "L", json!([])),
            tpl("right", "R", json!([])),
            end(json!([
                {"variable": "l", "value_selector": ["left", "output"]},
                {"variable": "r", "value_selector": ["right", "output"]}
            ])),
        ],
        vec![
            EdgeConfig::new("s", "left"),
            EdgeConfig::new("s", "right"),
            EdgeConfig::new("left", "end"),
            EdgeConfig::new("right", "end"),
        ],
    );

    let result = executor.run(&wf, RunRequest::default()).await.unwrap();

    assert_eq!(result.outcome.outputs, inputs(json!({"l": "L", "r": "R"})));
    let rows = attempts(&pool, result.execution_id).await;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.last().unwrap().0, "end");
}

fn sign_workflow() -> Workflow {
    workflow(
        vec![
            start(json!([{"variable": "x", "type": "number"}])),
            node(
                "cond",
                json!({
                    "type": "if-else",
                    "cases": [{
                        "case_id": "pos",
                        "conditions": [{"variable_selector": ["s", "x"], "comparison_operator": ">", "value": 0}]
                    }]
                }),
            ),
            tpl("positive", "positive {{ v }}", json!([{"variable": "v", "value_selector": ["s", "x"]}])),
            tpl("negative", "not positive {{ v }}", json!([{"variable": "v", "value_selector": ["s", "x"]}])),
            end(json!([
                {"variable": "pos", "value_selector": ["positive", "output"]},
                {"variable": "neg", "value_selector": ["negative", "output"]}
            ])),
        ],
        vec![
            EdgeConfig::new("s", "cond"),
            EdgeConfig::with_handle("cond", "pos", "positive"),
            EdgeConfig::with_handle("cond", "false", "negative"),
            EdgeConfig::new("positive", "end"),
            EdgeConfig::new("negative", "end"),
        ],
    )
}

#[tokio::test]
async fn if_else_runs_only_the_selected_branch() {
    let (pool, executor) = setup().await;
    let wf = sign_workflow();

    let result = executor.run(&wf, RunRequest::new(inputs(json!({"x": 5})))).await.unwrap();
    assert_eq!(result.outcome.status, RunStatus::Succeeded);
    assert_eq!(result.outcome.outputs["pos"], json!("positive 5"));
    assert_eq!(result.outcome.outputs["neg"], Value::Null);
    assert_eq!(
        attempts(&pool, result.execution_id).await,
        pairs(&[("s", "succeeded"), ("cond", "succeeded"), ("positive", "succeeded"), ("end", "succeeded")])
    );

    let result = executor.run(&wf, RunRequest::new(inputs(json!({"x": -2})))).await.unwrap();
    assert_eq!(result.outcome.outputs["neg"], json!("not positive -2"));
    let ran: Vec<_> = attempts(&pool, result.execution_id).await.into_iter().map(|(n, _)| n).collect();
    assert_eq!(ran, ["s", "cond", "negative", "end"]);
}

#[tokio::test]
async fn question_classifier_runs_only_the_chosen_class_branch() {
    let (pool, executor) = setup().await;
    let model = ScriptedModel::replying("refund");
    let executor = executor.with_services(NodeServices::default().with_model(Arc::new(model)));
    let wf = workflow(
        vec![
            start(json!([{"variable": "q"}])),
            node(
                "classify",
                json!({
                    "type": "question-classifier",
                    "query_variable_selector": ["s", "q"],
                    "model": {"provider": "scripted", "name": "m"},
                    "classes": [{"id": "general", "name": "General"}, {"id": "refund", "name": "Refunds"}]
                }),
            ),
            tpl("faq", "see the FAQ", json!([])),
            tpl("refunds", "class {{ c }}", json!([{"variable": "c", "value_selector": ["classify", "class_name"]}])),
            end(json!([
                {"variable": "faq", "value_selector": ["faq", "output"]},
                {"variable": "refunds", "value_selector": ["refunds", "output"]}
            ])),
        ],
        vec![
            EdgeConfig::new("s", "classify"),
            EdgeConfig::with_handle("classify", "general", "faq"),
            EdgeConfig::with_handle("classify", "refund", "refunds"),
            EdgeConfig::new("faq", "end"),
            EdgeConfig::new("refunds", "end"),
        ],
    );

    let result = executor.run(&wf, RunRequest::new(inputs(json!({"q": "I want my money back"})))).await.unwrap();
    assert_eq!(result.outcome.status, RunStatus::Succeeded);
    assert_eq!(result.outcome.outputs["refunds"], json!("class Refunds"));
    assert_eq!(result.outcome.outputs["faq"], Value::Null);
    let ran: Vec<_> = attempts(&pool, result.execution_id).await.into_iter().map(|(n, _)| n).collect();
    assert_eq!(ran, ["s", "classify", "refunds", "end"]);
}

#[tokio::test]
async fn missing_required_input_fails_before_anything_is_persisted() {
    let (pool, executor) = setup().await;
    let err = executor.run(&sign_workflow(), RunRequest::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::MissingVariable(ref key) if key == "s.x"));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workflow_executions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

// ============================================================
// Error strategies and retries
// ============================================================

fn code_node(id: &str, extra: Value) -> NodeConfig {
    let mut data = json!({
        "type": "code",
        "code_language": "python3",
        "code": "def main(): ...",
        "outputs": {"result": {"type": "number"}}
    });
    if let (Some(data), Some(extra)) = (data.as_object_mut(), extra.as_object()) {
        data.extend(extra.clone());
    }
    node(id, data)
}

fn with_code(executor: WorkflowExecutor, code: MockCodeExecutor) -> WorkflowExecutor {
    executor.with_services(NodeServices::default().with_code_executor(Arc::new(code)))
}

#[tokio::test]
async fn fail_branch_routes_to_the_error_handler() {
    let (pool, executor) = setup().await;
    let executor = with_code(executor, MockCodeExecutor::failing_fatal("boom"));
    let wf = workflow(
        vec![
            start(json!([])),
            code_node("code", json!({"error_strategy": "fail-branch"})),
            tpl("ok", "ok", json!([])),
            tpl("err", "failed: {{ m }}", json!([{"variable": "m", "value_selector": ["code", "error_message"]}])),
            end(json!([
                {"variable": "ok", "value_selector": ["ok", "output"]},
                {"variable": "err", "value_selector": ["err", "output"]}
            ])),
        ],
        vec![
            EdgeConfig::new("s", "code"),
            EdgeConfig::new("code", "ok"),
            EdgeConfig::with_handle("code", "fail-branch", "err"),
            EdgeConfig::new("ok", "end"),
            EdgeConfig::new("err", "end"),
        ],
    );

    let result = executor.run(&wf, RunRequest::default()).await.unwrap();

    assert_eq!(result.outcome.status, RunStatus::PartialSucceeded);
    assert_eq!(result.outcome.exceptions_count, 1);
    assert_eq!(result.outcome.outputs["err"], json!("failed: fatal node error: boom"));
    assert_eq!(result.outcome.outputs["ok"], Value::Null);
    assert_eq!(
        attempts(&pool, result.execution_id).await,
        pairs(&[("s", "succeeded"), ("code", "exception"), ("err", "succeeded"), ("end", "succeeded")])
    );
    assert_eq!(run_status(&pool, result.execution_id).await, WorkflowExecutionStatus::PartialSucceeded);
}

#[tokio::test]
async fn remove_node_continues_down_the_normal_path() {
    let (_pool, executor) = setup().await;
    let services = NodeServices::default().with_tool("search", Arc::new(MockTool::failing_fatal("offline")));
    let executor = executor.with_services(services);
    let wf = workflow(
        vec![
            start(json!([])),
            node(
                "tool",
                json!({"type": "tool", "provider_id": "search", "tool_name": "web", "error_strategy": "remove-node"}),
            ),
            tpl("after", "still here", json!([])),
            end(json!([{"variable": "out", "value_selector": ["after", "output"]}])),
        ],
        chain(&["s", "tool", "after", "end"]),
    );

    let outcome = executor.run(&wf, RunRequest::default()).await.unwrap().outcome;
    assert_eq!(outcome.status, RunStatus::PartialSucceeded);
    assert_eq!(outcome.outputs["out"], json!("still here"));
}

#[tokio::test]
async fn default_value_substitutes_configured_outputs() {
    let (_pool, executor) = setup().await;
    let executor = with_code(executor, MockCodeExecutor::failing_fatal("boom"));
    let wf = workflow(
        vec![
            start(json!([])),
            code_node(
                "code",
                json!({"error_strategy": "default-value", "default_value": [{"key": "result", "value": 42}]}),
            ),
            end(json!([{"variable": "result", "value_selector": ["code", "result"]}])),
        ],
        chain(&["s", "code", "end"]),
    );

    let outcome = executor.run(&wf, RunRequest::default()).await.unwrap().outcome;
    assert_eq!(outcome.status, RunStatus::PartialSucceeded);
    assert_eq!(outcome.outputs["result"], json!(42));
}

#[tokio::test]
async fn retryable_failures_are_retried_with_one_row_per_attempt() {
    let (pool, executor) = setup().await;
    let tool = Arc::new(MockTool::failing_retryable_times(2, json!("found it")));
    let executor = executor.with_services(NodeServices::default().with_tool("search", tool.clone()));
    let wf = workflow(
        vec![
            start(json!([])),
            node(
                "tool",
                json!({
                    "type": "tool",
                    "provider_id": "search",
                    "tool_name": "web",
                    "retry_config": {"max_retries": 3, "retry_interval_ms": 1}
                }),
            ),
            end(json!([{"variable": "text", "value_selector": ["tool", "text"]}])),
        ],
        chain(&["s", "tool", "end"]),
    );

    let result = executor.run(&wf, RunRequest::default()).await.unwrap();

    assert_eq!(result.outcome.status, RunStatus::Succeeded);
    assert_eq!(result.outcome.outputs["text"], json!("found it"));
    assert_eq!(tool.call_count(), 3);
    assert_eq!(
        attempts(&pool, result.execution_id).await,
        pairs(&[
            ("s", "succeeded"),
            ("tool", "retry"),
            ("tool", "retry"),
            ("tool", "succeeded"),
            ("end", "succeeded"),
        ])
    );
}

#[tokio::test]
async fn terminate_run_fails_the_whole_run() {
    let (pool, executor) = setup().await;
    let services = NodeServices::default().with_tool("search", Arc::new(MockTool::failing_fatal("offline")));
    let executor = executor.with_services(services);
    let wf = workflow(
        vec![
            start(json!([])),
            node("tool", json!({"type": "tool", "provider_id": "search", "tool_name": "web"})),
            end(json!([])),
        ],
        chain(&["s", "tool", "end"]),
    );

    let result = executor.run(&wf, RunRequest::default()).await.unwrap();

    assert_eq!(result.outcome.status, RunStatus::Failed);
    assert!(result.outcome.error.as_deref().unwrap().contains("node 'tool' failed"));
    assert_eq!(attempts(&pool, result.execution_id).await, pairs(&[("s", "succeeded"), ("tool", "failed")]));

    let run = executions::get_workflow_execution(&pool, result.execution_id).await.unwrap();
    assert_eq!(run.status().unwrap(), WorkflowExecutionStatus::Failed);
    assert!(run.error_message.unwrap().contains("offline"));
}

#[tokio::test]
async fn exceeding_max_steps_fails_the_run() {
    let pool = create_memory_pool().await.unwrap();
    let executor = WorkflowExecutor::new(pool, ExecutorConfig { max_steps: 2, ..test_config() });
    let wf = workflow(
        vec![start(json!([])), tpl("a", "a", json!([])), tpl("b", "b", json!([])), end(json!([]))],
        chain(&["s", "a", "b", "end"]),
    );

    let outcome = executor.run(&wf, RunRequest::default()).await.unwrap().outcome;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.unwrap().contains("max steps exceeded"));
    assert_eq!(outcome.steps, 2);
}

// ============================================================
// Abort, pause and resume
// ============================================================

fn llm_workflow() -> Workflow {
    workflow(
        vec![
            start(json!([{"variable": "q"}])),
            node(
                "llm",
                json!({
                    "type": "llm",
                    "model": {"provider": "scripted", "name": "m"},
                    "prompt_template": [{"role": "user", "text": "{{#s.q#}}"}]
                }),
            ),
            node("answer", json!({"type": "answer", "answer": "{{#llm.text#}}"})),
        ],
        chain(&["s", "llm", "answer"]),
    )
}

#[tokio::test]
async fn abort_stops_the_run_and_fails_orphaned_attempts() {
    let (pool, executor) = setup().await;
    let model = ScriptedModel::replying("one two three four five six").with_chunk_delay(Duration::from_millis(50));
    let executor = executor.with_services(NodeServices::default().with_model(Arc::new(model)));
    let mut events = executor.subscribe();

    let prepared = executor.prepare(&llm_workflow(), RunRequest::new(inputs(json!({"q": "hi"})))).unwrap();
    let handle = prepared.engine.handle();
    let (outcome, _) = tokio::join!(prepared.engine.run(), async {
        while let Some(event) = events.recv().await {
            if matches!(&event, GraphEvent::NodeStarted { info } if info.node_id == "llm") {
                break;
            }
        }
        handle.abort("user cancelled")
    });

    assert_eq!(outcome.status, RunStatus::Stopped);
    assert_eq!(outcome.error.as_deref(), Some("user cancelled"));
    let rows = executions::list_node_executions(&pool, prepared.run_id).await.unwrap();
    let llm = rows.iter().find(|r| r.node_id == "llm").unwrap();
    assert_eq!(llm.status, "failed");
    assert_eq!(llm.error.as_deref(), Some("user cancelled"));
    assert!(rows.iter().all(|r| r.node_id != "answer"));
    assert_eq!(run_status(&pool, prepared.run_id).await, WorkflowExecutionStatus::Stopped);
}

fn approval_workflow() -> Workflow {
    workflow(
        vec![
            start(json!([])),
            node("ask", json!({"type": "human-input", "prompt": "Approve?", "fields": ["approved"]})),
            tpl("fmt", "approved: {{ a }}", json!([{"variable": "a", "value_selector": ["ask", "approved"]}])),
            end(json!([{"variable": "result", "value_selector": ["fmt", "output"]}])),
        ],
        chain(&["s", "ask", "fmt", "end"]),
    )
}

#[tokio::test]
async fn human_input_pauses_and_resume_completes_the_run() {
    let (pool, executor) = setup().await;
    let wf = approval_workflow();

    let paused = executor.run(&wf, RunRequest::default()).await.unwrap();
    assert_eq!(paused.outcome.status, RunStatus::Paused);
    assert_eq!(paused.outcome.paused_node_ids, ["ask"]);
    let run_id = paused.execution_id;
    let row = executions::get_workflow_execution(&pool, run_id).await.unwrap();
    assert_eq!(row.status().unwrap(), WorkflowExecutionStatus::Paused);
    assert!(row.pause_snapshot.is_some());

    let payload = inputs(json!({"approved": "yes"}));
    let resumed = executor.resume(&wf, run_id, Some(payload)).await.unwrap();

    assert_eq!(resumed.execution_id, run_id);
    assert_eq!(resumed.outcome.status, RunStatus::Succeeded);
    assert_eq!(resumed.outcome.outputs["result"], json!("approved: yes"));

    let rows = executions::list_node_executions(&pool, run_id).await.unwrap();
    assert_eq!(rows.iter().map(|r| r.execution_index).collect::<Vec<_>>(), [1, 2, 3, 4, 5]);
    assert_eq!(
        rows.into_iter().map(|r| (r.node_id, r.status)).collect::<Vec<_>>(),
        pairs(&[
            ("s", "succeeded"),
            ("ask", "paused"),
            ("ask", "succeeded"),
            ("fmt", "succeeded"),
            ("end", "succeeded"),
        ])
    );
    let row = executions::get_workflow_execution(&pool, run_id).await.unwrap();
    assert_eq!(row.status().unwrap(), WorkflowExecutionStatus::Succeeded);
    assert!(row.pause_snapshot.is_none());

    let again = executor.resume(&wf, run_id, None).await.unwrap_err();
    assert!(matches!(again, EngineError::NotPaused(id) if id == run_id));
}

#[tokio::test]
async fn external_pause_resumes_to_the_same_result_as_an_uninterrupted_run() {
    let (pool, executor) = setup().await;
    let model = ScriptedModel::replying("left side").with_chunk_delay(Duration::from_millis(40));
    let executor = executor.with_services(NodeServices::default().with_model(Arc::new(model)));
    let wf = workflow(
        vec![
            start(json!([{"variable": "q"}])),
            node(
                "llm",
                json!({
                    "type": "llm",
                    "model": {"provider": "scripted", "name": "m"},
                    "prompt_template": [{"role": "user", "text": "{{#s.q#}}"}]
                }),
            ),
            tpl("right", "right side", json!([])),
            end(json!([
                {"variable": "left", "value_selector": ["llm", "text"]},
                {"variable": "right", "value_selector": ["right", "output"]}
            ])),
        ],
        vec![
            EdgeConfig::new("s", "llm"),
            EdgeConfig::new("s", "right"),
            EdgeConfig::new("llm", "end"),
            EdgeConfig::new("right", "end"),
        ],
    );
    let request = || RunRequest::new(inputs(json!({"q": "hi"})));

    let baseline = executor.run(&wf, request()).await.unwrap().outcome;
    assert_eq!(baseline.status, RunStatus::Succeeded);

    let mut events = executor.subscribe();
    let prepared = executor.prepare(&wf, request()).unwrap();
    let run_id = prepared.run_id;
    let handle = prepared.engine.handle();
    let (paused, _) = tokio::join!(prepared.engine.run(), async {
        while let Some(event) = events.recv().await {
            if matches!(&event, GraphEvent::NodeStarted { info } if info.node_id == "llm") {
                break;
            }
        }
        handle.pause("operator")
    });

    assert_eq!(paused.status, RunStatus::Paused);
    assert!(paused.paused_node_ids.is_empty());
    let row = executions::get_workflow_execution(&pool, run_id).await.unwrap();
    assert_eq!(row.status().unwrap(), WorkflowExecutionStatus::Paused);
    assert!(row.pause_snapshot.is_some());
    assert!(attempts(&pool, run_id).await.iter().all(|(node_id, _)| node_id != "end"));

    let resumed = executor.resume(&wf, run_id, None).await.unwrap().outcome;
    assert_eq!(resumed.status, RunStatus::Succeeded);
    assert_eq!(resumed.outputs, baseline.outputs);
    assert_eq!(run_status(&pool, run_id).await, WorkflowExecutionStatus::Succeeded);
}

#[tokio::test]
async fn corrupt_snapshot_leaves_the_run_untouched() {
    let (pool, executor) = setup().await;
    let wf = approval_workflow();
    let run_id = executor.run(&wf, RunRequest::default()).await.unwrap().execution_id;

    let garbage = WorkflowExecutionUpdate {
        status: WorkflowExecutionStatus::Paused,
        outputs: None,
        error_message: None,
        total_tokens: 0,
        total_steps: 2,
        exceptions_count: 0,
        pause_snapshot: Some("{\"version\": 1, \"pool\": 7}".into()),
        finished_at: None,
    };
    executions::update_workflow_execution(&pool, run_id, &garbage).await.unwrap();

    let err = executor.resume(&wf, run_id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::CorruptSnapshot(_)));

    let row = executions::get_workflow_execution(&pool, run_id).await.unwrap();
    assert_eq!(row.status().unwrap(), WorkflowExecutionStatus::Paused);
    assert_eq!(row.pause_snapshot, garbage.pause_snapshot);
}

// ============================================================
// Containers
// ============================================================

#[tokio::test]
async fn iteration_collects_one_output_per_item() {
    let (pool, executor) = setup().await;
    let wf = workflow(
        vec![
            start(json!([{"variable": "items", "type": "json"}])),
            node(
                "it",
                json!({
                    "type": "iteration",
                    "iterator_selector": ["s", "items"],
                    "output_selector": ["body", "output"]
                }),
            ),
            child("it_start", "it", json!({"type": "iteration-start"})),
            child(
                "body",
                "it",
                json!({
                    "type": "template-transform",
                    "template": "item {{ x }}",
                    "variables": [{"variable": "x", "value_selector": ["it", "item"]}]
                }),
            ),
            end(json!([{"variable": "all", "value_selector": ["it", "output"]}])),
        ],
        vec![EdgeConfig::new("s", "it"), EdgeConfig::new("it", "end"), EdgeConfig::new("it_start", "body")],
    );

    let result = executor.run(&wf, RunRequest::new(inputs(json!({"items": ["a", "b"]})))).await.unwrap();

    assert_eq!(result.outcome.status, RunStatus::Succeeded);
    assert_eq!(result.outcome.outputs["all"], json!(["item a", "item b"]));

    let rows = executions::list_node_executions(&pool, result.execution_id).await.unwrap();
    let bodies: Vec<_> = rows.iter().filter(|r| r.node_id == "body").collect();
    assert_eq!(bodies.len(), 2);
    assert!(bodies.iter().all(|r| r.iteration_id.as_deref() == Some("it")));
}

#[tokio::test]
async fn loop_runs_until_its_break_condition_holds() {
    let (_pool, executor) = setup().await;
    let wf = workflow(
        vec![
            start(json!([])),
            node(
                "lp",
                json!({
                    "type": "loop",
                    "loop_count": 10,
                    "break_conditions": [
                        {"variable_selector": ["lp", "count"], "comparison_operator": "≥", "value": 3}
                    ],
                    "loop_variables": [{"label": "count", "value_type": "constant", "value": 0}]
                }),
            ),
            child("lp_start", "lp", json!({"type": "loop-start"})),
            child(
                "inc",
                "lp",
                json!({
                    "type": "variable-assigner",
                    "items": [{
                        "variable_selector": ["lp", "count"],
                        "operation": "+=",
                        "input_type": "constant",
                        "value": 1
                    }]
                }),
            ),
            end(json!([{"variable": "count", "value_selector": ["lp", "count"]}])),
        ],
        vec![EdgeConfig::new("s", "lp"), EdgeConfig::new("lp", "end"), EdgeConfig::new("lp_start", "inc")],
    );

    let outcome = executor.run(&wf, RunRequest::default()).await.unwrap().outcome;
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.outputs["count"], json!(3));
}

// ============================================================
// Streaming
// ============================================================

#[tokio::test]
async fn answer_chunks_stream_to_their_sink() {
    let (_pool, executor) = setup().await;
    let model = ScriptedModel::replying("hello world");
    let executor = executor.with_services(NodeServices::default().with_model(Arc::new(model)));
    let mut events = executor.subscribe();

    let outcome = executor.run(&llm_workflow(), RunRequest::new(inputs(json!({"q": "hi"})))).await.unwrap().outcome;
    assert_eq!(outcome.outputs["answer"], json!("hello world"));

    let mut responder = AnswerStreamResponder::new();
    let mut streamed = String::new();
    while let Some(event) = events.try_recv() {
        for output in responder.handle(&event) {
            assert_eq!(output.sink_id.as_deref(), Some("answer"));
            streamed.push_str(&output.chunk);
        }
    }
    assert_eq!(streamed, "hello world");
    assert_eq!(events.dropped(), 0);
}

// ============================================================
// Validation and read-only scopes
// ============================================================

#[tokio::test]
async fn environment_is_readable_but_never_assignable() {
    let (_pool, executor) = setup().await;
    let mut wf = workflow(
        vec![
            start(json!([])),
            tpl("greet", "{{ g }}", json!([{"variable": "g", "value_selector": ["env", "GREETING"]}])),
            end(json!([{"variable": "out", "value_selector": ["greet", "output"]}])),
        ],
        chain(&["s", "greet", "end"]),
    );
    wf.environment_variables.insert("GREETING".into(), json!("hi"));
    let outcome = executor.run(&wf, RunRequest::default()).await.unwrap().outcome;
    assert_eq!(outcome.outputs["out"], json!("hi"));

    wf.graph.nodes.push(node(
        "assign",
        json!({
            "type": "variable-assigner",
            "items": [{"variable_selector": ["env", "GREETING"], "operation": "set", "input_type": "constant", "value": "bye"}]
        }),
    ));
    wf.graph.edges.push(EdgeConfig::new("s", "assign"));
    let err = executor.run(&wf, RunRequest::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidNodeConfig { ref node_id, .. } if node_id == "assign"));
}

#[tokio::test]
async fn nodes_named_after_reserved_scopes_are_rejected() {
    let (pool, executor) = setup().await;
    let mut wf = workflow(
        vec![
            start(json!([])),
            tpl("conversation", "shadow", json!([])),
            tpl("read", "{{ n }}", json!([{"variable": "n", "value_selector": ["conversation", "name"]}])),
            end(json!([{"variable": "out", "value_selector": ["read", "output"]}])),
        ],
        chain(&["s", "conversation", "read", "end"]),
    );
    wf.conversation_variables.insert("name".into(), json!("kept"));

    let err = executor.run(&wf, RunRequest::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidNodeConfig { ref node_id, .. } if node_id == "conversation"));
    let runs: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workflow_executions").fetch_one(&pool).await.unwrap();
    assert_eq!(runs.0, 0);
}

#[tokio::test]
async fn constant_division_by_zero_is_rejected_up_front() {
    let (_pool, executor) = setup().await;
    let wf = workflow(
        vec![
            start(json!([])),
            node(
                "assign",
                json!({
                    "type": "variable-assigner",
                    "items": [{"variable_selector": ["conversation", "total"], "operation": "/=", "input_type": "constant", "value": 0}]
                }),
            ),
        ],
        chain(&["s", "assign"]),
    );
    let err = executor.run(&wf, RunRequest::default()).await.unwrap_err();
    assert!(err.to_string().contains("division by zero"));
}

// ============================================================
// Telemetry hand-off
// ============================================================

#[tokio::test]
async fn finished_runs_are_handed_to_the_trace_queue() {
    let (_pool, executor) = setup().await;
    let (tx, mut rx) = mpsc::channel(4);
    let executor = executor.with_trace_queue(tx);
    let wf = workflow(vec![start(json!([])), end(json!([]))], chain(&["s", "end"]));

    let result = executor.run(&wf, RunRequest::default()).await.unwrap();

    let task = rx.try_recv().expect("trace task");
    assert_eq!(task.execution.id, result.execution_id);
    assert_eq!(task.execution.status, "succeeded");
}
