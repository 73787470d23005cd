//! Built-in node kinds, one module per `type`.

mod answer;
mod assigner;
mod code;
mod end;
mod human_input;
mod if_else;
mod llm;
mod question_classifier;
mod start;
mod template_transform;
mod tool;

pub use answer::AnswerNode;
pub use assigner::VariableAssignerNode;
pub use code::CodeNode;
pub use end::EndNode;
pub use human_input::HumanInputNode;
pub use if_else::IfElseNode;
pub use llm::LlmNode;
pub use question_classifier::QuestionClassifierNode;
pub use start::StartNode;
pub use template_transform::TemplateTransformNode;
pub use tool::ToolNode;

use serde_json::{Map, Value};

use crate::variables::NodeInputs;

/// JSON view of an input snapshot keyed by dotted selector.
pub fn inputs_json(inputs: &NodeInputs) -> Map<String, Value> {
    inputs.iter().map(|(sel, v)| (sel.to_string(), v.to_json())).collect()
}
