//! Branch guards.
//!
//! An action may carry a `Condition` over the result of one of its
//! dependencies. When the dependency has completed and the condition does not
//! hold, the action is bypassed instead of run, and so is everything that
//! only hangs off bypassed actions.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::model::ActionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
    IsEmpty,
    IsNotEmpty,
    InList,
    NotInList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dependency whose result is inspected.
    pub source: ActionId,
    /// Dotted path into the source's result object.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: JsonValue,
    /// Take the branch when the comparison does *not* hold.
    #[serde(default)]
    pub negate: bool,
}

impl Condition {
    pub fn new(
        source: impl Into<ActionId>,
        field: impl Into<String>,
        operator: ConditionOperator,
        value: JsonValue,
    ) -> Self {
        Self {
            source: source.into(),
            field: field.into(),
            operator,
            value,
            negate: false,
        }
    }

    /// The complementary branch of `self`.
    pub fn otherwise(&self) -> Self {
        Self {
            negate: !self.negate,
            ..self.clone()
        }
    }

    /// Evaluate against the source action's result; a missing result or
    /// field reads as null.
    pub fn holds(&self, result: Option<&JsonValue>) -> bool {
        let actual = result
            .and_then(|r| lookup(r, &self.field))
            .unwrap_or(&JsonValue::Null);
        compare(actual, self.operator, &self.value) != self.negate
    }
}

fn lookup<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

fn compare(actual: &JsonValue, operator: ConditionOperator, expected: &JsonValue) -> bool {
    use ConditionOperator::*;
    match operator {
        Equals => actual == expected,
        NotEquals => actual != expected,
        GreaterThan => match (number(actual), expected.as_f64()) {
            (a, Some(b)) => a > b,
            _ => false,
        },
        LessThan => match (number(actual), expected.as_f64()) {
            (a, Some(b)) => a < b,
            _ => false,
        },
        Contains => contains(actual, expected),
        NotContains => !contains(actual, expected),
        IsEmpty => is_empty(actual),
        IsNotEmpty => !is_empty(actual),
        InList => expected.as_array().is_some_and(|list| list.contains(actual)),
        NotInList => !expected.as_array().is_some_and(|list| list.contains(actual)),
    }
}

/// Missing and non-numeric values count as zero.
fn number(value: &JsonValue) -> f64 {
    match value {
        JsonValue::Number(n) => n.as_f64().unwrap_or(0.0),
        JsonValue::String(s) => s.trim().parse().unwrap_or(0.0),
        JsonValue::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

fn contains(actual: &JsonValue, needle: &JsonValue) -> bool {
    match actual {
        JsonValue::Array(items) => items.contains(needle),
        JsonValue::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        JsonValue::Null => false,
        other => needle.as_str().is_some_and(|n| other.to_string().contains(n)),
    }
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        JsonValue::Object(o) => o.is_empty(),
    }
}
