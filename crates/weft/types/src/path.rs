use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypeError;
use crate::event::Event;

const EVENT_FIELDS: [&str; 4] = ["id", "type", "time", "data"];

/// An address of a value inside a bound event or value.
///
/// `review.data.value`, `review.value` (shorthand for `review.data.value`),
/// `results.items.0.title` (numeric segments index arrays).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValuePath {
    binding: String,
    segments: Vec<String>,
}

impl ValuePath {
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        let raw = raw.trim();
        let mut parts = raw.split('.');
        let binding = match parts.next() {
            Some(b) if !b.is_empty() => b.to_string(),
            _ => return Err(TypeError::InvalidPath(raw.to_string())),
        };
        let segments: Vec<String> = parts.map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(TypeError::InvalidPath(raw.to_string()));
        }
        Ok(Self { binding, segments })
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolve against a bound event. Segments that do not start with an event
    /// field (`id`, `type`, `time`, `data`) are looked up inside `data`.
    pub fn resolve_event(&self, event: &Event) -> Option<Value> {
        let root = event.to_value();
        match self.segments.first() {
            None => Some(root),
            Some(first) if EVENT_FIELDS.contains(&first.as_str()) => {
                lookup(&root, &self.segments).cloned()
            }
            Some(_) => lookup(&root["data"], &self.segments).cloned(),
        }
    }

    /// Resolve against a plain value bound under this path's binding name.
    pub fn resolve_value(&self, root: &Value) -> Option<Value> {
        lookup(root, &self.segments).cloned()
    }
}

/// Walk `segments` into `root`. Numeric segments index arrays.
pub fn lookup<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

impl TryFrom<String> for ValuePath {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ValuePath> for String {
    fn from(value: ValuePath) -> Self {
        value.to_string()
    }
}

impl FromStr for ValuePath {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.binding)?;
        for segment in &self.segments {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}
