use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::inputs_json;
use crate::config::LlmNodeData;
use crate::services::{ModelRequest, PromptMessage};
use crate::template::Template;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Renders prompt messages and calls the run's model client, streaming
/// deltas under `<node>.text`.
pub struct LlmNode {
    node_id: String,
    data: LlmNodeData,
    templates: Vec<Template>,
}

impl LlmNode {
    pub fn new(node_id: impl Into<String>, data: LlmNodeData) -> Self {
        let templates = data.prompt_template.iter().map(|m| Template::parse(&m.text)).collect();
        Self { node_id: node_id.into(), data, templates }
    }
}

#[async_trait]
impl ExecutableNode for LlmNode {
    fn input_selectors(&self) -> Vec<Selector> {
        let mut out: Vec<Selector> = Vec::new();
        for sel in self.templates.iter().flat_map(Template::selectors) {
            if !out.contains(&sel) {
                out.push(sel);
            }
        }
        out
    }

    async fn execute(&self, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let messages: Vec<PromptMessage> = self
            .data
            .prompt_template
            .iter()
            .zip(&self.templates)
            .map(|(msg, tpl)| PromptMessage { role: msg.role, text: tpl.render(&inputs) })
            .collect();

        let request = ModelRequest {
            provider: self.data.model.provider.clone(),
            model: self.data.model.name.clone(),
            messages,
            parameters: self.data.model.completion_params.clone(),
        };

        let text_selector = Selector::new(self.node_id.clone(), "text");
        let stream = ctx.stream.clone();
        let on_chunk = move |chunk: &str| stream.send(&text_selector, chunk);

        debug!(node_id = %self.node_id, model = %request.model, "Invoking model");
        let response = ctx.services.model.invoke(&request, &on_chunk).await?;

        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);
        result.process_data.insert(
            "prompts".into(),
            serde_json::to_value(&request.messages).unwrap_or(Value::Null),
        );
        result.process_data.insert("model_provider".into(), json!(request.provider));
        result.process_data.insert("model_name".into(), json!(request.model));
        result.outputs.insert("text".into(), Segment::String(response.text));
        result.outputs.insert(
            "usage".into(),
            Segment::from_json(serde_json::to_value(&response.usage).unwrap_or(Value::Null)),
        );
        result.metadata.total_tokens = response.usage.total_tokens;
        Ok(NodeOutcome::Completed(result))
    }
}
