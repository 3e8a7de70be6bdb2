use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypeError;

/// Event payload. Ordered so that serialization (and therefore hashing) is deterministic.
pub type EventData = BTreeMap<String, Value>;

/// Reserved data key carrying scheduler provenance (see [`Origin`]).
pub const ORIGIN_KEY: &str = "_origin";

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique event identifier, assigned by the log at append time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub uuid::Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Result<Self, TypeError> {
        uuid::Uuid::parse_str(value)
            .map(Self)
            .map_err(|_| TypeError::InvalidEventId(value.to_string()))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Time ─────────────────────────────────────────────────────────────

/// Log timestamp.
///
/// Totally ordered: physical milliseconds first, then the logical counter.
/// Field order matters for the derived `Ord`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub physical_ms: u64,
    pub logical: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        physical_ms: 0,
        logical: 0,
    };

    pub fn new(physical_ms: u64, logical: u32) -> Self {
        Self {
            physical_ms,
            logical,
        }
    }

    pub fn from_millis(physical_ms: u64) -> Self {
        Self::new(physical_ms, 0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.physical_ms, self.logical)
    }
}

// ── Event types and patterns ─────────────────────────────────────────

/// A dot-namespaced event type symbol, e.g. `tool.request`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    pub fn parse(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        validate_symbol(&value).map_err(|reason| TypeError::InvalidEventType {
            value: value.clone(),
            reason,
        })?;
        Ok(Self(value))
    }

    /// Build a type from a symbol known at compile time (see [`crate::well_known`]).
    pub fn well_known(value: &'static str) -> Self {
        debug_assert!(validate_symbol(value).is_ok(), "invalid symbol {value}");
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First segment of the symbol (`tool` for `tool.request`).
    pub fn namespace(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }
}

fn validate_symbol(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("empty symbol".into());
    }
    for segment in value.split('.') {
        if segment.is_empty() {
            return Err("empty segment".into());
        }
        if let Some(c) = segment
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
        {
            return Err(format!("unexpected character '{c}'"));
        }
    }
    Ok(())
}

impl TryFrom<String> for EventType {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

impl FromStr for EventType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Matches event types: `*`, an exact symbol, or `namespace.*`.
///
/// `tool.*` matches `tool.request` and `tool.request.retry` but not `tool`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypePattern {
    Any,
    Exact(EventType),
    Prefix(String),
}

impl TypePattern {
    pub fn parse(value: &str) -> Result<Self, TypeError> {
        if value == "*" {
            return Ok(TypePattern::Any);
        }
        if let Some(prefix) = value.strip_suffix(".*") {
            validate_symbol(prefix).map_err(|_| TypeError::InvalidPattern(value.to_string()))?;
            return Ok(TypePattern::Prefix(prefix.to_string()));
        }
        EventType::parse(value)
            .map(TypePattern::Exact)
            .map_err(|_| TypeError::InvalidPattern(value.to_string()))
    }

    pub fn exact(event_type: EventType) -> Self {
        TypePattern::Exact(event_type)
    }

    pub fn matches(&self, event_type: &EventType) -> bool {
        match self {
            TypePattern::Any => true,
            TypePattern::Exact(expected) => expected == event_type,
            TypePattern::Prefix(prefix) => {
                let s = event_type.as_str();
                s.len() > prefix.len()
                    && s.starts_with(prefix.as_str())
                    && s.as_bytes()[prefix.len()] == b'.'
            }
        }
    }
}

impl TryFrom<String> for TypePattern {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TypePattern> for String {
    fn from(value: TypePattern) -> Self {
        value.to_string()
    }
}

impl FromStr for TypePattern {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TypePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypePattern::Any => f.write_str("*"),
            TypePattern::Exact(t) => write!(f, "{t}"),
            TypePattern::Prefix(p) => write!(f, "{p}.*"),
        }
    }
}

// ── Provenance ───────────────────────────────────────────────────────

/// Which workflow instance and node produced an event.
///
/// Stored under [`ORIGIN_KEY`] in the event data; replay relies on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub instance: String,
    pub workflow: String,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl Origin {
    pub fn new(
        instance: impl Into<String>,
        workflow: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            workflow: workflow.into(),
            node: node.into(),
            iteration: None,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// BLAKE3 digest over an event's identity and content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntegrityHash(pub [u8; 32]);

impl fmt::Display for IntegrityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "...")
    }
}

/// An admitted, immutable event.
///
/// Identity is the [`EventId`]; two events with equal type, time and data are
/// still distinct events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub time: Timestamp,
    pub data: EventData,
    pub integrity_hash: IntegrityHash,
}

impl Event {
    /// Build an event and compute its integrity hash.
    pub fn seal(id: EventId, event_type: EventType, time: Timestamp, data: EventData) -> Self {
        let integrity_hash = Self::compute_hash(&id, &event_type, &time, &data);
        Self {
            id,
            event_type,
            time,
            data,
            integrity_hash,
        }
    }

    pub fn verify_integrity(&self) -> bool {
        self.integrity_hash == Self::compute_hash(&self.id, &self.event_type, &self.time, &self.data)
    }

    fn compute_hash(
        id: &EventId,
        event_type: &EventType,
        time: &Timestamp,
        data: &EventData,
    ) -> IntegrityHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"weft-event-v1:");
        hasher.update(id.0.as_bytes());

        let type_bytes = event_type.as_str().as_bytes();
        hasher.update(&(type_bytes.len() as u32).to_le_bytes());
        hasher.update(type_bytes);

        hasher.update(&time.physical_ms.to_le_bytes());
        hasher.update(&time.logical.to_le_bytes());

        if let Ok(data_bytes) = serde_json::to_vec(data) {
            hasher.update(&data_bytes);
        }

        IntegrityHash(*hasher.finalize().as_bytes())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// Dotted lookup into `data` (`usage.tokens`, `items.0`).
    pub fn field(&self, dotted: &str) -> Option<&Value> {
        field_in(&self.data, dotted)
    }

    pub fn is(&self, pattern: &TypePattern) -> bool {
        pattern.matches(&self.event_type)
    }

    pub fn origin(&self) -> Option<Origin> {
        self.data
            .get(ORIGIN_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// JSON view used by value paths: `{id, type, time, data}`.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "type": self.event_type.as_str(),
            "time": {
                "physical_ms": self.time.physical_ms,
                "logical": self.time.logical,
            },
            "data": self.data,
        })
    }
}

/// An event proposed for admission. The log assigns id and (if absent) time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
    #[serde(default)]
    pub data: EventData,
}

impl CandidateEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            time: None,
            data: EventData::new(),
        }
    }

    pub fn parse(event_type: &str) -> Result<Self, TypeError> {
        Ok(Self::new(EventType::parse(event_type)?))
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data.extend(data);
        self
    }

    pub fn with_time(mut self, time: Timestamp) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_origin(self, origin: &Origin) -> Self {
        let value = serde_json::to_value(origin).unwrap_or(Value::Null);
        self.with(ORIGIN_KEY, value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    pub fn field(&self, dotted: &str) -> Option<&Value> {
        field_in(&self.data, dotted)
    }

    pub fn origin(&self) -> Option<Origin> {
        self.data
            .get(ORIGIN_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn field_in<'a>(data: &'a EventData, dotted: &str) -> Option<&'a Value> {
    let mut segments = dotted.split('.');
    let first = data.get(segments.next()?)?;
    segments.try_fold(first, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
