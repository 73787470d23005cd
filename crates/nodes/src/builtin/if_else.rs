use async_trait::async_trait;
use serde_json::json;

use super::inputs_json;
use crate::condition::evaluate_all;
use crate::config::IfElseNodeData;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Handle taken when no case matches.
pub const FALSE_HANDLE: &str = "false";

pub struct IfElseNode {
    data: IfElseNodeData,
}

impl IfElseNode {
    pub fn new(data: IfElseNodeData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ExecutableNode for IfElseNode {
    fn input_selectors(&self) -> Vec<Selector> {
        let mut out: Vec<Selector> = Vec::new();
        for cond in self.data.cases.iter().flat_map(|c| &c.conditions) {
            if !out.contains(&cond.variable_selector) {
                out.push(cond.variable_selector.clone());
            }
        }
        out
    }

    async fn execute(&self, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let selected = self
            .data
            .cases
            .iter()
            .find(|case| evaluate_all(&case.conditions, case.logical_operator, &inputs))
            .map(|case| case.case_id.clone());

        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);
        result.process_data.insert("selected_case_id".into(), json!(selected));
        result.outputs.insert("result".into(), Segment::Boolean(selected.is_some()));
        result.outputs.insert(
            "selected_case_id".into(),
            selected.clone().map(Segment::String).unwrap_or(Segment::None),
        );
        result.edge_source_handle = Some(selected.unwrap_or_else(|| FALSE_HANDLE.to_string()));
        Ok(NodeOutcome::Completed(result))
    }
}
