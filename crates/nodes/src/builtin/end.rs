use async_trait::async_trait;

use super::inputs_json;
use crate::config::EndNodeData;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Collects named run outputs. Unresolved selectors produce `None`.
pub struct EndNode {
    data: EndNodeData,
}

impl EndNode {
    pub fn new(data: EndNodeData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ExecutableNode for EndNode {
    fn input_selectors(&self) -> Vec<Selector> {
        self.data.outputs.iter().map(|o| o.value_selector.clone()).collect()
    }

    async fn execute(&self, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);
        for binding in &self.data.outputs {
            let value = inputs.get(&binding.value_selector).cloned().unwrap_or(Segment::None);
            result.outputs.insert(binding.variable.clone(), value);
        }
        Ok(NodeOutcome::Completed(result))
    }
}
