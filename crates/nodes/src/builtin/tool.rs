use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::inputs_json;
use crate::config::{ToolInputKind, ToolNodeData};
use crate::template::Template;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Invokes a registered tool provider with resolved parameters.
pub struct ToolNode {
    data: ToolNodeData,
}

impl ToolNode {
    pub fn new(data: ToolNodeData) -> Self {
        Self { data }
    }

    fn parameters(&self, inputs: &NodeInputs) -> Result<Map<String, Value>, NodeError> {
        let mut params = Map::new();
        for (name, input) in &self.data.tool_parameters {
            let value = match input.kind {
                ToolInputKind::Constant => input.value.clone(),
                ToolInputKind::Variable => {
                    let selector: Selector = serde_json::from_value(input.value.clone()).map_err(|e| {
                        NodeError::InvalidInput(format!("parameter '{name}' has a bad selector: {e}"))
                    })?;
                    inputs.get(&selector).map(Segment::to_json).unwrap_or(Value::Null)
                }
                ToolInputKind::Mixed => {
                    let source = input.value.as_str().unwrap_or_default();
                    Value::String(Template::parse(source).render(inputs))
                }
            };
            params.insert(name.clone(), value);
        }
        Ok(params)
    }
}

#[async_trait]
impl ExecutableNode for ToolNode {
    fn input_selectors(&self) -> Vec<Selector> {
        let mut out: Vec<Selector> = Vec::new();
        for input in self.data.tool_parameters.values() {
            let found = match input.kind {
                ToolInputKind::Constant => Vec::new(),
                ToolInputKind::Variable => serde_json::from_value::<Selector>(input.value.clone())
                    .map(|s| vec![s])
                    .unwrap_or_default(),
                ToolInputKind::Mixed => Template::parse(input.value.as_str().unwrap_or_default()).selectors(),
            };
            for sel in found {
                if !out.contains(&sel) {
                    out.push(sel);
                }
            }
        }
        out
    }

    async fn execute(&self, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let provider = ctx.services.tools.get(&self.data.provider_id).ok_or_else(|| {
            NodeError::Unsupported(format!("tool provider '{}' is not registered", self.data.provider_id))
        })?;
        let params = self.parameters(&inputs)?;

        debug!(provider = %self.data.provider_id, tool = %self.data.tool_name, "Invoking tool");
        let value = provider.invoke(&self.data.tool_name, &params).await?;

        let text = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);
        result.process_data.insert("tool_parameters".into(), Value::Object(params));
        result.outputs.insert("text".into(), Segment::String(text));
        result.outputs.insert("json".into(), Segment::from_json(value));
        Ok(NodeOutcome::Completed(result))
    }
}
