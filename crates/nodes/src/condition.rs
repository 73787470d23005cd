//! Condition evaluation shared by `if-else` cases and loop break conditions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::variables::{NodeInputs, Segment, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not contains")]
    NotContains,
    #[serde(rename = "start with")]
    StartWith,
    #[serde(rename = "end with")]
    EndWith,
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "not empty")]
    NotEmpty,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "≠", alias = "!=")]
    NotEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "≥", alias = ">=")]
    GreaterOrEqual,
    #[serde(rename = "≤", alias = "<=")]
    LessOrEqual,
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "not null")]
    NotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable_selector: Selector,
    pub comparison_operator: ComparisonOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    /// Evaluate against the input snapshot; a missing variable is `None`.
    pub fn evaluate(&self, inputs: &NodeInputs) -> bool {
        compare(self.comparison_operator, inputs.get(&self.variable_selector), &self.value)
    }
}

/// Combine conditions; an empty list is never satisfied.
pub fn evaluate_all(conditions: &[Condition], operator: LogicalOperator, inputs: &NodeInputs) -> bool {
    if conditions.is_empty() {
        return false;
    }
    match operator {
        LogicalOperator::And => conditions.iter().all(|c| c.evaluate(inputs)),
        LogicalOperator::Or => conditions.iter().any(|c| c.evaluate(inputs)),
    }
}

fn expected_text(expected: &Value) -> String {
    match expected {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn expected_number(expected: &Value) -> Option<f64> {
    match expected {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(op: ComparisonOperator, actual: Option<&Segment>, expected: &Value) -> bool {
    use ComparisonOperator::*;

    let actual = match actual {
        None | Some(Segment::None) => {
            return matches!(op, Empty | Null | NotContains | NotIn);
        }
        Some(a) => a,
    };

    match op {
        Null => false,
        NotNull => true,
        Empty => actual.is_empty(),
        NotEmpty => !actual.is_empty(),
        Contains => contains(actual, expected),
        NotContains => !contains(actual, expected),
        StartWith => actual.text().starts_with(&expected_text(expected)),
        EndWith => actual.text().ends_with(&expected_text(expected)),
        Is => is_equal(actual, expected),
        IsNot => !is_equal(actual, expected),
        In => member_of(actual, expected),
        NotIn => !member_of(actual, expected),
        Equal | NotEqual | GreaterThan | LessThan | GreaterOrEqual | LessOrEqual => {
            let (Some(a), Some(b)) = (actual.as_f64(), expected_number(expected)) else {
                return false;
            };
            match op {
                Equal => a == b,
                NotEqual => a != b,
                GreaterThan => a > b,
                LessThan => a < b,
                GreaterOrEqual => a >= b,
                _ => a <= b,
            }
        }
    }
}

fn contains(actual: &Segment, expected: &Value) -> bool {
    let needle = expected_text(expected);
    match actual {
        Segment::Array(items) => items.iter().any(|i| i.text() == needle),
        Segment::ArrayFile(files) => files.iter().any(|f| f.filename.as_deref() == Some(needle.as_str())),
        other => other.text().contains(&needle),
    }
}

fn is_equal(actual: &Segment, expected: &Value) -> bool {
    match (actual, expected) {
        (Segment::Boolean(a), Value::Bool(b)) => a == b,
        (Segment::Boolean(a), Value::String(s)) => s.parse::<bool>().map(|b| *a == b).unwrap_or(false),
        _ => actual.text() == expected_text(expected),
    }
}

fn member_of(actual: &Segment, expected: &Value) -> bool {
    let text = actual.text();
    match expected {
        Value::Array(items) => items.iter().any(|i| expected_text(i) == text),
        other => expected_text(other) == text,
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> NodeInputs {
        pairs
            .iter()
            .map(|(sel, v)| (Selector::parse(sel).unwrap(), Segment::from_json(v.clone())))
            .collect()
    }

    fn cond(sel: &str, op: &str, value: Value) -> Condition {
        serde_json::from_value(json!({
            "variable_selector": sel.split('.').collect::<Vec<_>>(),
            "comparison_operator": op,
            "value": value,
        }))
        .unwrap()
    }

    #[test]
    fn numeric_comparisons_accept_numeric_strings() {
        let pool = inputs(&[("start.x", json!(5))]);
        assert!(cond("start.x", ">", json!("0")).evaluate(&pool));
        assert!(cond("start.x", "≥", json!(5)).evaluate(&pool));
        assert!(cond("start.x", ">=", json!(5)).evaluate(&pool));
        assert!(!cond("start.x", "<", json!(5)).evaluate(&pool));
    }

    #[test]
    fn string_and_array_operators() {
        let pool = inputs(&[("start.q", json!("hello world")), ("start.tags", json!(["a", "b"]))]);
        assert!(cond("start.q", "contains", json!("world")).evaluate(&pool));
        assert!(cond("start.q", "start with", json!("hell")).evaluate(&pool));
        assert!(cond("start.tags", "contains", json!("b")).evaluate(&pool));
        assert!(cond("start.tags", "not contains", json!("c")).evaluate(&pool));
        assert!(cond("start.q", "in", json!(["hello world", "bye"])).evaluate(&pool));
    }

    #[test]
    fn missing_variables_only_satisfy_absence_checks() {
        let pool = NodeInputs::new();
        assert!(cond("start.nope", "null", json!(null)).evaluate(&pool));
        assert!(cond("start.nope", "empty", json!(null)).evaluate(&pool));
        assert!(!cond("start.nope", "not null", json!(null)).evaluate(&pool));
        assert!(!cond("start.nope", "=", json!(0)).evaluate(&pool));
    }

    #[test]
    fn logical_operators_combine_conditions() {
        let pool = inputs(&[("start.x", json!(5))]);
        let conditions = vec![cond("start.x", ">", json!(10)), cond("start.x", "<", json!(10))];
        assert!(!evaluate_all(&conditions, LogicalOperator::And, &pool));
        assert!(evaluate_all(&conditions, LogicalOperator::Or, &pool));
        assert!(!evaluate_all(&[], LogicalOperator::Or, &pool));
    }
}
