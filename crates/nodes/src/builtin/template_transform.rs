use std::collections::BTreeMap;

use async_trait::async_trait;

use super::inputs_json;
use crate::config::TemplateTransformNodeData;
use crate::template::render_named;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

const MAX_OUTPUT_LENGTH: usize = 400_000;

pub struct TemplateTransformNode {
    data: TemplateTransformNodeData,
}

impl TemplateTransformNode {
    pub fn new(data: TemplateTransformNodeData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ExecutableNode for TemplateTransformNode {
    fn input_selectors(&self) -> Vec<Selector> {
        self.data.variables.iter().map(|v| v.value_selector.clone()).collect()
    }

    async fn execute(&self, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let values: BTreeMap<String, String> = self
            .data
            .variables
            .iter()
            .map(|b| {
                let text = inputs.get(&b.value_selector).map(Segment::text).unwrap_or_default();
                (b.variable.clone(), text)
            })
            .collect();

        let rendered = render_named(&self.data.template, &values);
        if rendered.len() > MAX_OUTPUT_LENGTH {
            return Err(NodeError::InvalidInput(format!(
                "rendered template exceeds {MAX_OUTPUT_LENGTH} bytes"
            )));
        }

        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);
        result.outputs.insert("output".into(), Segment::String(rendered));
        Ok(NodeOutcome::Completed(result))
    }
}
