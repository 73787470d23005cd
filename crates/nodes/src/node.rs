//! Closed dispatch over the built-in node kinds.

use async_trait::async_trait;

use crate::builtin::*;
use crate::config::NodeKind;
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Selector};
use crate::NodeError;

/// One variant per leaf node type. Container kinds (`iteration`, `loop`)
/// drive a sub-graph and are executed by the engine itself.
pub enum BuiltinNode {
    Start(StartNode),
    End(EndNode),
    Answer(AnswerNode),
    Llm(LlmNode),
    IfElse(IfElseNode),
    QuestionClassifier(QuestionClassifierNode),
    TemplateTransform(TemplateTransformNode),
    VariableAssigner(VariableAssignerNode),
    Tool(ToolNode),
    Code(CodeNode),
    HumanInput(HumanInputNode),
    /// `iteration-start` / `loop-start`: entry marker of a sub-graph.
    ContainerStart,
}

impl BuiltinNode {
    /// `None` for container kinds.
    pub fn from_kind(node_id: &str, kind: &NodeKind) -> Option<Self> {
        let node = match kind {
            NodeKind::Start(d) => Self::Start(StartNode::new(node_id, d.clone())),
            NodeKind::End(d) => Self::End(EndNode::new(d.clone())),
            NodeKind::Answer(d) => Self::Answer(AnswerNode::new(d)),
            NodeKind::Llm(d) => Self::Llm(LlmNode::new(node_id, d.clone())),
            NodeKind::IfElse(d) => Self::IfElse(IfElseNode::new(d.clone())),
            NodeKind::QuestionClassifier(d) => {
                Self::QuestionClassifier(QuestionClassifierNode::new(node_id, d.clone()))
            }
            NodeKind::TemplateTransform(d) => Self::TemplateTransform(TemplateTransformNode::new(d.clone())),
            NodeKind::VariableAssigner(d) => Self::VariableAssigner(VariableAssignerNode::new(d.clone())),
            NodeKind::Tool(d) => Self::Tool(ToolNode::new(d.clone())),
            NodeKind::Code(d) => Self::Code(CodeNode::new(d.clone())),
            NodeKind::HumanInput(d) => Self::HumanInput(HumanInputNode::new(d.clone())),
            NodeKind::IterationStart {} | NodeKind::LoopStart {} => Self::ContainerStart,
            NodeKind::Iteration(_) | NodeKind::Loop(_) => return None,
        };
        Some(node)
    }
}

#[async_trait]
impl ExecutableNode for BuiltinNode {
    fn input_selectors(&self) -> Vec<Selector> {
        match self {
            Self::Start(n) => n.input_selectors(),
            Self::End(n) => n.input_selectors(),
            Self::Answer(n) => n.input_selectors(),
            Self::Llm(n) => n.input_selectors(),
            Self::IfElse(n) => n.input_selectors(),
            Self::QuestionClassifier(n) => n.input_selectors(),
            Self::TemplateTransform(n) => n.input_selectors(),
            Self::VariableAssigner(n) => n.input_selectors(),
            Self::Tool(n) => n.input_selectors(),
            Self::Code(n) => n.input_selectors(),
            Self::HumanInput(n) => n.input_selectors(),
            Self::ContainerStart => Vec::new(),
        }
    }

    async fn execute(&self, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        match self {
            Self::Start(n) => n.execute(inputs, ctx).await,
            Self::End(n) => n.execute(inputs, ctx).await,
            Self::Answer(n) => n.execute(inputs, ctx).await,
            Self::Llm(n) => n.execute(inputs, ctx).await,
            Self::IfElse(n) => n.execute(inputs, ctx).await,
            Self::QuestionClassifier(n) => n.execute(inputs, ctx).await,
            Self::TemplateTransform(n) => n.execute(inputs, ctx).await,
            Self::VariableAssigner(n) => n.execute(inputs, ctx).await,
            Self::Tool(n) => n.execute(inputs, ctx).await,
            Self::Code(n) => n.execute(inputs, ctx).await,
            Self::HumanInput(n) => n.execute(inputs, ctx).await,
            Self::ContainerStart => Ok(NodeOutcome::Completed(NodeRunResult::default())),
        }
    }
}
