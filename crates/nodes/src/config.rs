//! Node configuration as it appears under `data` in a graph document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::{Condition, LogicalOperator};
use crate::services::PromptMessage;
use crate::variables::{FileTransferMethod, FileType, Segment, SegmentType, Selector};

// ---------------------------------------------------------------------------
// Shared settings
// ---------------------------------------------------------------------------

/// What the engine does when a node attempt fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    #[default]
    TerminateRun,
    FailBranch,
    RemoveNode,
    DefaultValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_interval_ms: u64,
}

/// One output value substituted under the `default-value` strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultValue {
    pub key: String,
    pub value: Value,
}

/// The `data` object of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub default_value: Vec<DefaultValue>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl NodeData {
    pub fn default_outputs(&self) -> BTreeMap<String, Segment> {
        self.default_value
            .iter()
            .map(|d| (d.key.clone(), Segment::from_json(d.value.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeKind {
    Start(StartNodeData),
    End(EndNodeData),
    Answer(AnswerNodeData),
    Llm(LlmNodeData),
    IfElse(IfElseNodeData),
    QuestionClassifier(QuestionClassifierNodeData),
    TemplateTransform(TemplateTransformNodeData),
    VariableAssigner(VariableAssignerNodeData),
    Tool(ToolNodeData),
    Code(CodeNodeData),
    HumanInput(HumanInputNodeData),
    Iteration(IterationNodeData),
    IterationStart {},
    Loop(LoopNodeData),
    LoopStart {},
}

impl NodeKind {
    /// The `type` tag as written in graph documents.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::End(_) => "end",
            Self::Answer(_) => "answer",
            Self::Llm(_) => "llm",
            Self::IfElse(_) => "if-else",
            Self::QuestionClassifier(_) => "question-classifier",
            Self::TemplateTransform(_) => "template-transform",
            Self::VariableAssigner(_) => "variable-assigner",
            Self::Tool(_) => "tool",
            Self::Code(_) => "code",
            Self::HumanInput(_) => "human-input",
            Self::Iteration(_) => "iteration",
            Self::IterationStart {} => "iteration-start",
            Self::Loop(_) => "loop",
            Self::LoopStart {} => "loop-start",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Self::Iteration(_) | Self::Loop(_))
    }

    pub fn is_container_start(&self) -> bool {
        matches!(self, Self::IterationStart {} | Self::LoopStart {})
    }

    /// Configuration checks that do not depend on the rest of the graph.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::VariableAssigner(data) => data.validate(),
            Self::IfElse(data) if data.cases.is_empty() => Err("if-else node needs at least one case".into()),
            Self::QuestionClassifier(data) => data.validate(),
            Self::Loop(data) if data.loop_count == 0 => Err("loop_count must be at least 1".into()),
            _ => Ok(()),
        }
    }
}

/// `{variable, value_selector}` pair binding a local name to a pool value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableBinding {
    pub variable: String,
    pub value_selector: Selector,
}

// ---------------------------------------------------------------------------
// Per-kind configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InputVariableType {
    #[default]
    TextInput,
    Paragraph,
    Select,
    Number,
    Checkbox,
    Json,
    File,
    FileList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartVariable {
    pub variable: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub var_type: InputVariableType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
    /// Accepted transfer methods for file inputs; empty accepts all.
    #[serde(default)]
    pub allowed_file_upload_methods: Vec<FileTransferMethod>,
    #[serde(default)]
    pub allowed_file_types: Vec<FileType>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StartNodeData {
    #[serde(default)]
    pub variables: Vec<StartVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EndNodeData {
    #[serde(default)]
    pub outputs: Vec<VariableBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnswerNodeData {
    #[serde(default)]
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub completion_params: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmNodeData {
    pub model: ModelConfig,
    pub prompt_template: Vec<PromptMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfElseCase {
    pub case_id: String,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfElseNodeData {
    pub cases: Vec<IfElseCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierClass {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionClassifierNodeData {
    pub query_variable_selector: Selector,
    pub model: ModelConfig,
    pub classes: Vec<ClassifierClass>,
    /// Extra guidance appended to the classification prompt.
    #[serde(default)]
    pub instruction: String,
}

impl QuestionClassifierNodeData {
    fn validate(&self) -> Result<(), String> {
        if self.classes.is_empty() {
            return Err("question-classifier node needs at least one class".into());
        }
        for (i, class) in self.classes.iter().enumerate() {
            if class.id.is_empty() {
                return Err(format!("class {i} has an empty id"));
            }
            if self.classes[..i].iter().any(|c| c.id == class.id) {
                return Err(format!("duplicate class id '{}'", class.id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTransformNodeData {
    #[serde(default)]
    pub variables: Vec<VariableBinding>,
    pub template: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOperation {
    #[serde(rename = "over-write")]
    OverWrite,
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "append")]
    Append,
    #[serde(rename = "extend")]
    Extend,
    #[serde(rename = "remove-first")]
    RemoveFirst,
    #[serde(rename = "remove-last")]
    RemoveLast,
    #[serde(rename = "+=")]
    Add,
    #[serde(rename = "-=")]
    Subtract,
    #[serde(rename = "*=")]
    Multiply,
    #[serde(rename = "/=")]
    Divide,
}

impl AssignOperation {
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, Self::Add | Self::Subtract | Self::Multiply | Self::Divide)
    }

    /// Operations that take no operand.
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::Clear | Self::RemoveFirst | Self::RemoveLast)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssignerInputType {
    #[default]
    Variable,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignerItem {
    pub variable_selector: Selector,
    pub operation: AssignOperation,
    #[serde(default)]
    pub input_type: AssignerInputType,
    /// A selector array for `variable` inputs, a literal for `constant` inputs.
    #[serde(default)]
    pub value: Value,
}

impl AssignerItem {
    /// Source selector for `variable` inputs.
    pub fn value_selector(&self) -> Option<Selector> {
        if self.input_type != AssignerInputType::Variable || self.operation.is_unary() {
            return None;
        }
        serde_json::from_value(self.value.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableAssignerNodeData {
    pub items: Vec<AssignerItem>,
}

impl VariableAssignerNodeData {
    fn validate(&self) -> Result<(), String> {
        for item in &self.items {
            let target = &item.variable_selector;
            if target.is_system() || target.is_environment() {
                return Err(format!("cannot assign to read-only variable '{target}'"));
            }
            let needs_operand = !item.operation.is_unary();
            match item.input_type {
                AssignerInputType::Variable if needs_operand && item.value_selector().is_none() => {
                    return Err(format!("item for '{target}' needs a value selector"));
                }
                AssignerInputType::Constant if item.operation.is_arithmetic() => {
                    let Some(operand) = item.value.as_f64() else {
                        return Err(format!("arithmetic operand for '{target}' must be a number"));
                    };
                    if item.operation == AssignOperation::Divide && operand == 0.0 {
                        return Err(format!("division by zero assigning '{target}'"));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolInputKind {
    Variable,
    Constant,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    #[serde(rename = "type")]
    pub kind: ToolInputKind,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolNodeData {
    pub provider_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_parameters: BTreeMap<String, ToolInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeOutput {
    #[serde(rename = "type")]
    pub output_type: SegmentType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeNodeData {
    pub code_language: String,
    pub code: String,
    #[serde(default)]
    pub variables: Vec<VariableBinding>,
    #[serde(default)]
    pub outputs: BTreeMap<String, CodeOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HumanInputNodeData {
    #[serde(default)]
    pub prompt: String,
    /// Keys the resume payload must contain.
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IterationErrorMode {
    #[default]
    Terminated,
    ContinueOnError,
    RemoveAbnormalOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationNodeData {
    pub iterator_selector: Selector,
    pub output_selector: Selector,
    #[serde(default)]
    pub error_handle_mode: IterationErrorMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopVariable {
    pub label: String,
    #[serde(default)]
    pub value_type: AssignerInputType,
    /// Literal initial value, or a selector array when `value_type` is `variable`.
    #[serde(default)]
    pub value: Value,
}

impl LoopVariable {
    pub fn value_selector(&self) -> Option<Selector> {
        match self.value_type {
            AssignerInputType::Variable => serde_json::from_value(self.value.clone()).ok(),
            AssignerInputType::Constant => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopNodeData {
    pub loop_count: u32,
    #[serde(default)]
    pub break_conditions: Vec<Condition>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default)]
    pub loop_variables: Vec<LoopVariable>,
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tagged_node_data_with_shared_settings() {
        let data: NodeData = serde_json::from_value(json!({
            "type": "template-transform",
            "title": "Format",
            "error_strategy": "fail-branch",
            "retry_config": {"max_retries": 2, "retry_interval_ms": 10},
            "variables": [{"variable": "name", "value_selector": ["start", "name"]}],
            "template": "hi {{ name }}"
        }))
        .unwrap();

        assert_eq!(data.title, "Format");
        assert_eq!(data.error_strategy, ErrorStrategy::FailBranch);
        assert_eq!(data.retry_config.max_retries, 2);
        assert_eq!(data.kind.type_name(), "template-transform");
    }

    #[test]
    fn container_start_nodes_parse_without_fields() {
        let data: NodeData = serde_json::from_value(json!({"type": "iteration-start"})).unwrap();
        assert!(data.kind.is_container_start());
        assert_eq!(data.error_strategy, ErrorStrategy::TerminateRun);
    }

    #[test]
    fn assigner_rejects_constant_division_by_zero() {
        let data: NodeData = serde_json::from_value(json!({
            "type": "variable-assigner",
            "items": [{
                "variable_selector": ["conversation", "total"],
                "operation": "/=",
                "input_type": "constant",
                "value": 0
            }]
        }))
        .unwrap();
        let err = data.kind.validate().unwrap_err();
        assert!(err.contains("division by zero"));
    }

    #[test]
    fn assigner_rejects_environment_targets() {
        let data: NodeData = serde_json::from_value(json!({
            "type": "variable-assigner",
            "items": [{
                "variable_selector": ["env", "API_KEY"],
                "operation": "set",
                "input_type": "constant",
                "value": "x"
            }]
        }))
        .unwrap();
        assert!(data.kind.validate().is_err());
    }

    #[test]
    fn unknown_node_type_fails_to_parse() {
        let parsed = serde_json::from_value::<NodeData>(json!({"type": "knowledge-retrieval"}));
        assert!(parsed.is_err());
    }
}
