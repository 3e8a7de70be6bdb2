//! Input templates and the bindings they are rendered against.
//!
//! A template is plain JSON in which strings may reference bound values:
//! `"${results.items}"` is replaced by the referenced value with its type
//! preserved, `"about ${trigger.topic}"` interpolates into a string. Paths
//! that do not resolve render as `null` (or as nothing inside a string).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::{Event, ValuePath};

/// A value a name is bound to while an instance runs.
#[derive(Clone, Debug, PartialEq)]
pub enum Bound {
    /// A node's output (or the trigger) as admitted to the log.
    Event(Event),
    /// A value computed by the scheduler (branch decision, parallel join, loop index).
    Value(Value),
}

impl Bound {
    pub fn resolve(&self, path: &ValuePath) -> Option<Value> {
        match self {
            Bound::Event(event) => path.resolve_event(event),
            Bound::Value(value) => path.resolve_value(value),
        }
    }

    pub fn event(&self) -> Option<&Event> {
        match self {
            Bound::Event(event) => Some(event),
            Bound::Value(_) => None,
        }
    }

    /// The bound value as plain JSON.
    pub fn to_value(&self) -> Value {
        match self {
            Bound::Event(event) => event.to_value(),
            Bound::Value(value) => value.clone(),
        }
    }
}

/// Name → bound value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bindings {
    entries: BTreeMap<String, Bound>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_event(&mut self, name: impl Into<String>, event: Event) {
        self.entries.insert(name.into(), Bound::Event(event));
    }

    pub fn bind_value(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), Bound::Value(value));
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bind_value(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Bound> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, path: &ValuePath) -> Option<Value> {
        self.entries.get(path.binding())?.resolve(path)
    }

    /// Plain JSON view of every binding.
    pub fn to_values(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect()
    }
}

enum Piece<'a> {
    Text(&'a str),
    Ref(&'a str),
}

/// Split a string into literal text and `${...}` references.
fn pieces(raw: &str) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        if start > 0 {
            out.push(Piece::Text(&rest[..start]));
        }
        out.push(Piece::Ref(&rest[start + 2..start + 2 + len]));
        rest = &rest[start + 3 + len..];
    }
    if !rest.is_empty() {
        out.push(Piece::Text(rest));
    }
    out
}

/// A JSON value with `${path}` references.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template(pub Value);

impl Template {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn render(&self, bindings: &Bindings) -> Value {
        render_value(&self.0, bindings)
    }

    /// Every path referenced anywhere in the template.
    pub fn references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        collect_refs(&self.0, &mut refs);
        refs
    }
}

impl From<Value> for Template {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn render_value(value: &Value, bindings: &Bindings) -> Value {
    match value {
        Value::String(s) => render_str(s, bindings),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, bindings)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, bindings)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup(raw: &str, bindings: &Bindings) -> Value {
    ValuePath::parse(raw)
        .ok()
        .and_then(|path| bindings.resolve(&path))
        .unwrap_or(Value::Null)
}

fn render_str(raw: &str, bindings: &Bindings) -> Value {
    let parts = pieces(raw);
    if let [Piece::Ref(path)] = parts.as_slice() {
        return lookup(path, bindings);
    }
    if !parts.iter().any(|p| matches!(p, Piece::Ref(_))) {
        return Value::String(raw.to_string());
    }

    let mut out = String::new();
    for part in parts {
        match part {
            Piece::Text(text) => out.push_str(text),
            Piece::Ref(path) => match lookup(path, bindings) {
                Value::Null => {}
                Value::String(s) => out.push_str(&s),
                other => out.push_str(&other.to_string()),
            },
        }
    }
    Value::String(out)
}

fn collect_refs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(pieces(s).into_iter().filter_map(|p| match p {
            Piece::Ref(r) => Some(r.trim().to_string()),
            Piece::Text(_) => None,
        })),
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::{EventData, EventId, EventType, Timestamp};

    fn bindings() -> Bindings {
        let mut data = EventData::new();
        data.insert("topic".into(), json!("rust"));
        data.insert("items".into(), json!([1, 2, 3]));
        let trigger = Event::seal(
            EventId::new(),
            EventType::parse("user.query").unwrap(),
            Timestamp::from_millis(5),
            data,
        );
        let mut b = Bindings::new();
        b.bind_event("trigger", trigger);
        b.bind_value("iteration", json!(2));
        b
    }

    #[test]
    fn whole_reference_keeps_type() {
        let t = Template::new(json!({"list": "${trigger.items}", "n": "${iteration}"}));
        assert_eq!(t.render(&bindings()), json!({"list": [1, 2, 3], "n": 2}));
    }

    #[test]
    fn interpolation_and_missing_paths() {
        let t = Template::new(json!(["about ${trigger.topic}!", "${nothing.here}", "x${trigger.missing}y"]));
        assert_eq!(t.render(&bindings()), json!(["about rust!", null, "xy"]));
    }

    #[test]
    fn event_fields_are_addressable() {
        let t = Template::new(json!("${trigger.type}"));
        assert_eq!(t.render(&bindings()), json!("user.query"));
        let t = Template::new(json!("${trigger.data.topic}"));
        assert_eq!(t.render(&bindings()), json!("rust"));
    }

    #[test]
    fn references_are_collected() {
        let t = Template::new(json!({"a": "${x.y} and ${z}", "b": ["${w}"], "c": 3, "d": "${unclosed"}));
        let mut refs = t.references();
        refs.sort();
        assert_eq!(refs, vec!["w", "x.y", "z"]);
    }
}
