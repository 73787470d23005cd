use async_trait::async_trait;
use serde_json::Value;

use crate::config::HumanInputNodeData;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Pauses the run until a caller resumes it with a payload.
pub struct HumanInputNode {
    data: HumanInputNodeData,
}

impl HumanInputNode {
    pub fn new(data: HumanInputNodeData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ExecutableNode for HumanInputNode {
    fn input_selectors(&self) -> Vec<Selector> {
        Vec::new()
    }

    async fn execute(&self, _inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let Some(payload) = &ctx.resume_payload else {
            return Ok(NodeOutcome::PauseRequested { reason: self.data.prompt.clone() });
        };

        if let Some(missing) = self.data.fields.iter().find(|f| !payload.contains_key(f.as_str())) {
            return Err(NodeError::InvalidInput(format!("resume payload is missing '{missing}'")));
        }

        let mut result = NodeRunResult::default();
        result.inputs = payload.clone();
        result.outputs = payload
            .iter()
            .map(|(k, v): (&String, &Value)| (k.clone(), Segment::from_json(v.clone())))
            .collect();
        Ok(NodeOutcome::Completed(result))
    }
}
