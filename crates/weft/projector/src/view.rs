use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::{Event, TypePattern};

/// Which end of the matching events a window keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Take {
    First(usize),
    Last(usize),
}

/// A caller-supplied predicate with a stable name.
///
/// The name identifies the predicate for caching; two predicates with the
/// same name must behave identically. The function must be pure.
#[derive(Clone)]
pub struct NamedPredicate {
    name: String,
    test: Arc<dyn Fn(&Event) -> bool + Send + Sync>,
}

impl NamedPredicate {
    pub fn new(
        name: impl Into<String>,
        test: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            test: Arc::new(test),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test(&self, event: &Event) -> bool {
        (self.test)(event)
    }
}

impl fmt::Debug for NamedPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamedPredicate").field(&self.name).finish()
    }
}

/// A caller-supplied per-event measure with a stable name.
///
/// Events the measure returns `None` for do not contribute. Naming follows
/// the same rule as [`NamedPredicate`].
#[derive(Clone)]
pub struct NamedMeasure {
    name: String,
    measure: Arc<dyn Fn(&Event) -> Option<f64> + Send + Sync>,
}

impl NamedMeasure {
    pub fn new(
        name: impl Into<String>,
        measure: impl Fn(&Event) -> Option<f64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            measure: Arc::new(measure),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn measure(&self, event: &Event) -> Option<f64> {
        (self.measure)(event)
    }
}

impl fmt::Debug for NamedMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamedMeasure").field(&self.name).finish()
    }
}

/// Definition of a view over a context.
#[derive(Clone, Debug)]
pub enum ViewSpec {
    /// Events whose type matches.
    Filter(TypePattern),
    /// The first `n` events.
    First(usize),
    /// The last `n` events.
    Last(usize),
    /// The first or last `n` events whose type matches.
    Window { pattern: TypePattern, take: Take },
    /// The most recent event whose type matches.
    LatestOfType(TypePattern),
    /// How many events match.
    Count(TypePattern),
    /// Sum of a numeric data field over matching events. Non-numeric and
    /// missing values contribute nothing.
    Sum { pattern: TypePattern, field: String },
    /// Matching events whose data field equals `value`.
    FieldEquals {
        pattern: TypePattern,
        field: String,
        value: Value,
    },
    Predicate(NamedPredicate),
    /// Sum of a caller-supplied measure over all events.
    Tally(NamedMeasure),
}

impl ViewSpec {
    pub fn filter(pattern: TypePattern) -> Self {
        ViewSpec::Filter(pattern)
    }

    pub fn latest(pattern: TypePattern) -> Self {
        ViewSpec::LatestOfType(pattern)
    }

    pub fn count(pattern: TypePattern) -> Self {
        ViewSpec::Count(pattern)
    }

    pub fn sum(pattern: TypePattern, field: impl Into<String>) -> Self {
        ViewSpec::Sum {
            pattern,
            field: field.into(),
        }
    }

    pub fn predicate(
        name: impl Into<String>,
        test: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        ViewSpec::Predicate(NamedPredicate::new(name, test))
    }

    pub fn tally(
        name: impl Into<String>,
        measure: impl Fn(&Event) -> Option<f64> + Send + Sync + 'static,
    ) -> Self {
        ViewSpec::Tally(NamedMeasure::new(name, measure))
    }

    /// Stable identity of the view definition, used as a cache key.
    pub fn key(&self) -> String {
        match self {
            ViewSpec::Filter(p) => format!("filter:{p}"),
            ViewSpec::First(n) => format!("first:{n}"),
            ViewSpec::Last(n) => format!("last:{n}"),
            ViewSpec::Window { pattern, take } => match take {
                Take::First(n) => format!("window:{pattern}:first:{n}"),
                Take::Last(n) => format!("window:{pattern}:last:{n}"),
            },
            ViewSpec::LatestOfType(p) => format!("latest:{p}"),
            ViewSpec::Count(p) => format!("count:{p}"),
            ViewSpec::Sum { pattern, field } => format!("sum:{pattern}:{field}"),
            ViewSpec::FieldEquals {
                pattern,
                field,
                value,
            } => format!("eq:{pattern}:{field}:{value}"),
            ViewSpec::Predicate(p) => format!("predicate:{}", p.name()),
            ViewSpec::Tally(m) => format!("tally:{}", m.name()),
        }
    }
}

/// Result of projecting a view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Events(Vec<Event>),
    Latest(Option<Event>),
    Count(u64),
    Sum(f64),
}

impl View {
    pub fn events(&self) -> &[Event] {
        match self {
            View::Events(events) => events,
            View::Latest(Some(event)) => std::slice::from_ref(event),
            _ => &[],
        }
    }

    pub fn latest(&self) -> Option<&Event> {
        match self {
            View::Latest(event) => event.as_ref(),
            View::Events(events) => events.last(),
            _ => None,
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            View::Count(n) => *n,
            View::Events(events) => events.len() as u64,
            View::Latest(event) => u64::from(event.is_some()),
            View::Sum(_) => 0,
        }
    }

    /// Numeric value of an aggregate view.
    pub fn amount(&self) -> f64 {
        match self {
            View::Sum(total) => *total,
            View::Count(n) => *n as f64,
            _ => 0.0,
        }
    }
}
