use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::ValuePath;

use crate::template::Bindings;

/// A boolean test over bindings, used to end loops early.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Equals { path: ValuePath, value: Value },
    NotEquals { path: ValuePath, value: Value },
    /// The path resolves to a non-null value.
    Exists { path: ValuePath },
    /// The path resolves to something other than `null`, `false`, `0`, `""`, `[]` or `{}`.
    Truthy { path: ValuePath },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

impl Condition {
    pub fn equals(path: ValuePath, value: impl Into<Value>) -> Self {
        Condition::Equals {
            path,
            value: value.into(),
        }
    }

    pub fn truthy(path: ValuePath) -> Self {
        Condition::Truthy { path }
    }

    pub fn evaluate(&self, bindings: &Bindings) -> bool {
        match self {
            Condition::Equals { path, value } => bindings.resolve(path).as_ref() == Some(value),
            Condition::NotEquals { path, value } => bindings.resolve(path).as_ref() != Some(value),
            Condition::Exists { path } => bindings.resolve(path).is_some_and(|v| !v.is_null()),
            Condition::Truthy { path } => bindings.resolve(path).is_some_and(|v| truthy(&v)),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(bindings)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(bindings)),
            Condition::Not { condition } => !condition.evaluate(bindings),
        }
    }

    /// Binding names the condition reads.
    pub fn bindings(&self) -> Vec<&str> {
        match self {
            Condition::Equals { path, .. }
            | Condition::NotEquals { path, .. }
            | Condition::Exists { path }
            | Condition::Truthy { path } => vec![path.binding()],
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().flat_map(Condition::bindings).collect()
            }
            Condition::Not { condition } => condition.bindings(),
        }
    }
}
