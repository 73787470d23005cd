use async_trait::async_trait;
use serde_json::{Map, Value};

use super::inputs_json;
use crate::config::CodeNodeData;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Hands mapped variables to the configured code executor and checks the
/// returned object against the declared outputs.
pub struct CodeNode {
    data: CodeNodeData,
}

impl CodeNode {
    pub fn new(data: CodeNodeData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ExecutableNode for CodeNode {
    fn input_selectors(&self) -> Vec<Selector> {
        self.data.variables.iter().map(|v| v.value_selector.clone()).collect()
    }

    async fn execute(&self, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let executor = ctx
            .services
            .code
            .as_ref()
            .ok_or_else(|| NodeError::Unsupported("no code executor configured".into()))?;

        let arguments: Map<String, Value> = self
            .data
            .variables
            .iter()
            .map(|b| {
                let value = inputs.get(&b.value_selector).map(Segment::to_json).unwrap_or(Value::Null);
                (b.variable.clone(), value)
            })
            .collect();

        let returned = executor.execute(&self.data.code_language, &self.data.code, &arguments).await?;

        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);
        for (name, declared) in &self.data.outputs {
            let Some(raw) = returned.get(name) else {
                return Err(NodeError::Fatal(format!("output '{name}' is missing")));
            };
            let value = Segment::from_json(raw.clone());
            if !declared.output_type.accepts(&value) {
                return Err(NodeError::Fatal(format!(
                    "output '{name}' is not of type {:?}",
                    declared.output_type
                )));
            }
            result.outputs.insert(name.clone(), value);
        }
        Ok(NodeOutcome::Completed(result))
    }
}
