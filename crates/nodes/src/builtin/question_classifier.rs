use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::inputs_json;
use crate::config::{ClassifierClass, QuestionClassifierNodeData};
use crate::services::{ModelRequest, PromptMessage, PromptRole};
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Asks the model which class a query belongs to and routes along the
/// edge whose source handle is that class id.
pub struct QuestionClassifierNode {
    node_id: String,
    data: QuestionClassifierNodeData,
}

impl QuestionClassifierNode {
    pub fn new(node_id: impl Into<String>, data: QuestionClassifierNodeData) -> Self {
        Self { node_id: node_id.into(), data }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = String::from(
            "Classify the user's question into exactly one of the categories below. \
             Reply with the category id only.\n",
        );
        for class in &self.data.classes {
            prompt.push_str(&format!("{}: {}\n", class.id, class.name));
        }
        if !self.data.instruction.is_empty() {
            prompt.push_str(&self.data.instruction);
        }
        prompt
    }

    /// Exact id or name first, then the first class the reply mentions,
    /// then the first class.
    fn pick(&self, reply: &str) -> &ClassifierClass {
        let reply = reply.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.');
        let lowered = reply.to_lowercase();
        let classes = &self.data.classes;
        classes
            .iter()
            .find(|c| c.id == reply || c.name.to_lowercase() == lowered)
            .or_else(|| {
                classes.iter().find(|c| lowered.contains(&c.id.to_lowercase()) || lowered.contains(&c.name.to_lowercase()))
            })
            .unwrap_or(&classes[0])
    }
}

#[async_trait]
impl ExecutableNode for QuestionClassifierNode {
    fn input_selectors(&self) -> Vec<Selector> {
        vec![self.data.query_variable_selector.clone()]
    }

    async fn execute(&self, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        if self.data.classes.is_empty() {
            return Err(NodeError::Fatal("no classes configured".into()));
        }
        let query = inputs.get(&self.data.query_variable_selector).map(Segment::text).unwrap_or_default();

        let request = ModelRequest {
            provider: self.data.model.provider.clone(),
            model: self.data.model.name.clone(),
            messages: vec![
                PromptMessage { role: PromptRole::System, text: self.system_prompt() },
                PromptMessage { role: PromptRole::User, text: query.clone() },
            ],
            parameters: self.data.model.completion_params.clone(),
        };

        debug!(node_id = %self.node_id, model = %request.model, "Classifying query");
        // The raw reply is never shown to the user.
        let response = ctx.services.model.invoke(&request, &|_: &str| {}).await?;
        let class = self.pick(&response.text);

        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);
        result.process_data.insert("model_reply".into(), json!(response.text));
        result.process_data.insert("model_provider".into(), json!(request.provider));
        result.process_data.insert("model_name".into(), json!(request.model));
        result.outputs.insert("class_name".into(), Segment::String(class.name.clone()));
        result.outputs.insert("class_id".into(), Segment::String(class.id.clone()));
        result.outputs.insert(
            "usage".into(),
            Segment::from_json(serde_json::to_value(&response.usage).unwrap_or(Value::Null)),
        );
        result.metadata.total_tokens = response.usage.total_tokens;
        result.edge_source_handle = Some(class.id.clone());
        Ok(NodeOutcome::Completed(result))
    }
}
