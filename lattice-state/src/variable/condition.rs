//! Conditions and switch selection. Both are pure, local computations.

use std::cmp::Ordering;

use serde::Serialize;
use serde_json::Value;

use super::{Dependency, Variable};

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Truthy,
}

impl Operator {
    /// Apply the operator. `Truthy` ignores `other`.
    pub fn evaluate(self, value: &Value, other: &Value) -> bool {
        match self {
            Operator::Equal => loose_eq(value, other),
            Operator::NotEqual => !loose_eq(value, other),
            Operator::Greater => compare(value, other) == Some(Ordering::Greater),
            Operator::GreaterEqual => matches!(
                compare(value, other),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Less => compare(value, other) == Some(Ordering::Less),
            Operator::LessEqual => {
                matches!(compare(value, other), Some(Ordering::Less | Ordering::Equal))
            }
            Operator::Truthy => is_truthy(value),
        }
    }
}

/// `variable <operator> other`, used as a switch selector.
#[derive(Debug, Clone)]
pub struct Condition {
    pub variable: Variable,
    pub operator: Operator,
    pub other: Dependency,
}

impl Condition {
    pub fn new(variable: Variable, operator: Operator, other: impl Into<Dependency>) -> Self {
        Self {
            variable,
            operator,
            other: other.into(),
        }
    }

    pub fn truthy(variable: Variable) -> Self {
        Self::new(variable, Operator::Truthy, Value::Null)
    }
}

// 1 and 1.0 compare equal, as they would on the wire.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Map key a selector value is looked up under.
pub fn switch_key(selector: &Value) -> String {
    match selector {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pick `value_map[selector]`, or `default` when the key is missing or the
/// map is not an object.
pub fn select_case(selector: &Value, value_map: &Value, default: &Value) -> Value {
    let Value::Object(map) = value_map else {
        return default.clone();
    };
    map.get(&switch_key(selector))
        .cloned()
        .unwrap_or_else(|| default.clone())
}
