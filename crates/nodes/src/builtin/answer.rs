use async_trait::async_trait;

use super::inputs_json;
use crate::config::AnswerNodeData;
use crate::template::Template;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Answer sink: renders its template into the `answer` output.
pub struct AnswerNode {
    template: Template,
}

impl AnswerNode {
    pub fn new(data: &AnswerNodeData) -> Self {
        Self { template: Template::parse(&data.answer) }
    }

    pub fn template(&self) -> &Template {
        &self.template
    }
}

#[async_trait]
impl ExecutableNode for AnswerNode {
    fn input_selectors(&self) -> Vec<Selector> {
        self.template.selectors()
    }

    async fn execute(&self, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);
        result.outputs.insert("answer".into(), Segment::String(self.template.render(&inputs)));
        Ok(NodeOutcome::Completed(result))
    }
}
