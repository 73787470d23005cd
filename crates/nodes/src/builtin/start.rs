use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::StartNodeData;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Selector};
use crate::NodeError;

/// Entry node. User inputs were mapped into its scope before the run began;
/// it re-publishes them as its outputs.
pub struct StartNode {
    node_id: String,
    data: StartNodeData,
}

impl StartNode {
    pub fn new(node_id: impl Into<String>, data: StartNodeData) -> Self {
        Self { node_id: node_id.into(), data }
    }
}

#[async_trait]
impl ExecutableNode for StartNode {
    fn input_selectors(&self) -> Vec<Selector> {
        self.data
            .variables
            .iter()
            .map(|v| Selector::new(self.node_id.clone(), v.variable.clone()))
            .collect()
    }

    async fn execute(&self, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let outputs: BTreeMap<_, _> = inputs
            .iter()
            .map(|(sel, value)| (sel.name().to_string(), value.clone()))
            .collect();
        let mut result = NodeRunResult::with_outputs(outputs);
        result.inputs = result.outputs_json();
        Ok(NodeOutcome::Completed(result))
    }
}
