use async_trait::async_trait;
use serde_json::{json, Value};

use super::inputs_json;
use crate::config::{AssignOperation, AssignerInputType, AssignerItem, VariableAssignerNodeData};
use crate::traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult};
use crate::variables::{NodeInputs, Segment, Selector};
use crate::NodeError;

/// Computes new values for existing variables. The writes travel back in
/// `updated_variables`; the engine applies them to the pool.
pub struct VariableAssignerNode {
    data: VariableAssignerNodeData,
}

impl VariableAssignerNode {
    pub fn new(data: VariableAssignerNodeData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ExecutableNode for VariableAssignerNode {
    fn input_selectors(&self) -> Vec<Selector> {
        let mut out: Vec<Selector> = Vec::new();
        for item in &self.data.items {
            for sel in std::iter::once(item.variable_selector.clone()).chain(item.value_selector()) {
                if !out.contains(&sel) {
                    out.push(sel);
                }
            }
        }
        out
    }

    async fn execute(&self, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        let mut result = NodeRunResult::default();
        result.inputs = inputs_json(&inputs);

        // Later items observe earlier writes to the same target.
        let mut working = inputs;
        let mut written = Vec::new();
        for item in &self.data.items {
            let current = working.get(&item.variable_selector).cloned();
            let operand = operand(item, &working)?;
            let updated = apply(item.operation, current, operand, &item.variable_selector)?;
            written.push(json!({
                "selector": item.variable_selector.to_string(),
                "operation": item.operation,
                "value": updated.to_json(),
            }));
            working.insert(item.variable_selector.clone(), updated.clone());
            result.updated_variables.push((item.variable_selector.clone(), updated));
        }

        result.process_data.insert("updated_variables".into(), Value::Array(written));
        Ok(NodeOutcome::Completed(result))
    }
}

fn operand(item: &AssignerItem, inputs: &NodeInputs) -> Result<Option<Segment>, NodeError> {
    if item.operation.is_unary() {
        return Ok(None);
    }
    match item.input_type {
        AssignerInputType::Constant => Ok(Some(Segment::from_json(item.value.clone()))),
        AssignerInputType::Variable => {
            let Some(selector) = item.value_selector() else {
                return Err(NodeError::InvalidInput(format!(
                    "no value selector for '{}'",
                    item.variable_selector
                )));
            };
            inputs
                .get(&selector)
                .cloned()
                .map(Some)
                .ok_or_else(|| NodeError::MissingVariable(selector.to_string()))
        }
    }
}

fn apply(
    operation: AssignOperation,
    current: Option<Segment>,
    operand: Option<Segment>,
    target: &Selector,
) -> Result<Segment, NodeError> {
    use AssignOperation::*;

    let invalid = |msg: &str| NodeError::InvalidInput(format!("{target}: {msg}"));

    match operation {
        OverWrite | Set => operand.ok_or_else(|| invalid("missing operand")),
        Clear => Ok(match current.unwrap_or_default() {
            Segment::String(_) => Segment::String(String::new()),
            Segment::Integer(_) => Segment::Integer(0),
            Segment::Float(_) => Segment::Float(0.0),
            Segment::Boolean(_) => Segment::Boolean(false),
            Segment::Object(_) => Segment::Object(Default::default()),
            Segment::Array(_) => Segment::Array(Vec::new()),
            Segment::ArrayFile(_) => Segment::ArrayFile(Vec::new()),
            Segment::File(_) | Segment::None => Segment::None,
        }),
        Append => match (current, operand) {
            (Some(Segment::Array(mut items)), Some(value)) => {
                items.push(value);
                Ok(Segment::Array(items))
            }
            (Some(Segment::ArrayFile(mut files)), Some(Segment::File(file))) => {
                files.push(file);
                Ok(Segment::ArrayFile(files))
            }
            (None, _) => Err(NodeError::MissingVariable(target.to_string())),
            _ => Err(invalid("append needs an array target")),
        },
        Extend => match (current, operand) {
            (Some(Segment::Array(mut items)), Some(Segment::Array(more))) => {
                items.extend(more);
                Ok(Segment::Array(items))
            }
            (Some(Segment::ArrayFile(mut files)), Some(Segment::ArrayFile(more))) => {
                files.extend(more);
                Ok(Segment::ArrayFile(files))
            }
            (None, _) => Err(NodeError::MissingVariable(target.to_string())),
            _ => Err(invalid("extend needs array target and operand")),
        },
        RemoveFirst | RemoveLast => match current {
            Some(Segment::Array(mut items)) => {
                if !items.is_empty() {
                    if operation == RemoveFirst {
                        items.remove(0);
                    } else {
                        items.pop();
                    }
                }
                Ok(Segment::Array(items))
            }
            Some(Segment::ArrayFile(mut files)) => {
                if !files.is_empty() {
                    if operation == RemoveFirst {
                        files.remove(0);
                    } else {
                        files.pop();
                    }
                }
                Ok(Segment::ArrayFile(files))
            }
            None => Err(NodeError::MissingVariable(target.to_string())),
            Some(_) => Err(invalid("remove needs an array target")),
        },
        Add | Subtract | Multiply | Divide => {
            let current = current.ok_or_else(|| NodeError::MissingVariable(target.to_string()))?;
            let operand = operand.ok_or_else(|| invalid("missing operand"))?;
            arithmetic(operation, &current, &operand).ok_or_else(|| {
                if operation == Divide && operand.as_f64() == Some(0.0) {
                    invalid("division by zero")
                } else {
                    invalid("arithmetic needs numeric target and operand")
                }
            })
        }
    }
}

fn arithmetic(operation: AssignOperation, current: &Segment, operand: &Segment) -> Option<Segment> {
    use AssignOperation::*;

    if let (Segment::Integer(a), Segment::Integer(b)) = (current, operand) {
        let value = match operation {
            Add => a.checked_add(*b),
            Subtract => a.checked_sub(*b),
            Multiply => a.checked_mul(*b),
            _ => None,
        };
        if let Some(v) = value {
            return Some(Segment::Integer(v));
        }
    }
    if !matches!(current, Segment::Integer(_) | Segment::Float(_))
        || !matches!(operand, Segment::Integer(_) | Segment::Float(_))
    {
        return None;
    }
    let (a, b) = (current.as_f64()?, operand.as_f64()?);
    let value = match operation {
        Add => a + b,
        Subtract => a - b,
        Multiply => a * b,
        Divide if b == 0.0 => return None,
        Divide => a / b,
        _ => return None,
    };
    Some(Segment::Float(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::NodeServices;
    use crate::traits::StreamSink;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            node_id: "assign".into(),
            stream: StreamSink::disabled(),
            resume_payload: None,
            services: NodeServices::default(),
        }
    }

    fn node(items: Value) -> VariableAssignerNode {
        VariableAssignerNode::new(serde_json::from_value(json!({ "items": items })).unwrap())
    }

    fn completed(outcome: NodeOutcome) -> NodeRunResult {
        match outcome {
            NodeOutcome::Completed(r) => r,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_division_by_zero_is_invalid_input() {
        let assigner = node(json!([{
            "variable_selector": ["conversation", "total"],
            "operation": "/=",
            "input_type": "variable",
            "value": ["start", "divisor"]
        }]));
        let inputs = NodeInputs::from([
            (Selector::new("conversation", "total"), Segment::Integer(10)),
            (Selector::new("start", "divisor"), Segment::Integer(0)),
        ]);
        let err = assigner.execute(inputs, &ctx()).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidInput(ref m) if m.contains("division by zero")));
    }

    #[tokio::test]
    async fn integer_arithmetic_stays_integral_and_items_chain() {
        let assigner = node(json!([
            {"variable_selector": ["conversation", "n"], "operation": "+=", "input_type": "constant", "value": 2},
            {"variable_selector": ["conversation", "n"], "operation": "*=", "input_type": "constant", "value": 3}
        ]));
        let inputs = NodeInputs::from([(Selector::new("conversation", "n"), Segment::Integer(1))]);
        let result = completed(assigner.execute(inputs, &ctx()).await.unwrap());
        assert_eq!(
            result.updated_variables.last(),
            Some(&(Selector::new("conversation", "n"), Segment::Integer(9)))
        );
    }

    #[tokio::test]
    async fn array_operations() {
        let assigner = node(json!([
            {"variable_selector": ["conversation", "list"], "operation": "append", "input_type": "constant", "value": "c"},
            {"variable_selector": ["conversation", "list"], "operation": "remove-first"}
        ]));
        let inputs = NodeInputs::from([(
            Selector::new("conversation", "list"),
            Segment::from_json(json!(["a", "b"])),
        )]);
        let result = completed(assigner.execute(inputs, &ctx()).await.unwrap());
        assert_eq!(result.updated_variables[1].1, Segment::from_json(json!(["b", "c"])));
    }

    #[tokio::test]
    async fn clear_resets_to_type_zero_value() {
        let assigner = node(json!([
            {"variable_selector": ["conversation", "name"], "operation": "clear"}
        ]));
        let inputs = NodeInputs::from([(Selector::new("conversation", "name"), Segment::from("x"))]);
        let result = completed(assigner.execute(inputs, &ctx()).await.unwrap());
        assert_eq!(result.updated_variables[0].1, Segment::from(""));
    }
}
