use std::collections::VecDeque;

use weft_types::Event;

use crate::view::{Take, View, ViewSpec};

/// Running state of a view folded over a context, one event at a time.
#[derive(Clone, Debug)]
pub(crate) enum Accumulator {
    Events(Vec<Event>),
    Tail(VecDeque<Event>),
    Latest(Option<Event>),
    Count(u64),
    Sum(f64),
}

impl Accumulator {
    pub(crate) fn start(spec: &ViewSpec) -> Self {
        match spec {
            ViewSpec::Last(_)
            | ViewSpec::Window {
                take: Take::Last(_),
                ..
            } => Accumulator::Tail(VecDeque::new()),
            ViewSpec::LatestOfType(_) => Accumulator::Latest(None),
            ViewSpec::Count(_) => Accumulator::Count(0),
            ViewSpec::Sum { .. } | ViewSpec::Tally(_) => Accumulator::Sum(0.0),
            _ => Accumulator::Events(Vec::new()),
        }
    }

    pub(crate) fn push(&mut self, spec: &ViewSpec, event: &Event) {
        match (spec, self) {
            (ViewSpec::Filter(pattern), Accumulator::Events(out)) => {
                if pattern.matches(&event.event_type) {
                    out.push(event.clone());
                }
            }
            (ViewSpec::First(n), Accumulator::Events(out)) => {
                if out.len() < *n {
                    out.push(event.clone());
                }
            }
            (ViewSpec::Last(n), Accumulator::Tail(out)) => keep_last(out, *n, event),
            (
                ViewSpec::Window {
                    pattern,
                    take: Take::First(n),
                },
                Accumulator::Events(out),
            ) => {
                if out.len() < *n && pattern.matches(&event.event_type) {
                    out.push(event.clone());
                }
            }
            (
                ViewSpec::Window {
                    pattern,
                    take: Take::Last(n),
                },
                Accumulator::Tail(out),
            ) => {
                if pattern.matches(&event.event_type) {
                    keep_last(out, *n, event);
                }
            }
            (ViewSpec::LatestOfType(pattern), Accumulator::Latest(latest)) => {
                if pattern.matches(&event.event_type) {
                    *latest = Some(event.clone());
                }
            }
            (ViewSpec::Count(pattern), Accumulator::Count(n)) => {
                if pattern.matches(&event.event_type) {
                    *n += 1;
                }
            }
            (ViewSpec::Sum { pattern, field }, Accumulator::Sum(total)) => {
                if pattern.matches(&event.event_type) {
                    if let Some(x) = event.field(field).and_then(|v| v.as_f64()) {
                        *total += x;
                    }
                }
            }
            (
                ViewSpec::FieldEquals {
                    pattern,
                    field,
                    value,
                },
                Accumulator::Events(out),
            ) => {
                if pattern.matches(&event.event_type) && event.field(field) == Some(value) {
                    out.push(event.clone());
                }
            }
            (ViewSpec::Predicate(predicate), Accumulator::Events(out)) => {
                if predicate.test(event) {
                    out.push(event.clone());
                }
            }
            (ViewSpec::Tally(measure), Accumulator::Sum(total)) => {
                if let Some(x) = measure.measure(event) {
                    *total += x;
                }
            }
            // `start` always pairs a spec with its accumulator shape.
            _ => {}
        }
    }

    pub(crate) fn finish(&self) -> View {
        match self {
            Accumulator::Events(events) => View::Events(events.clone()),
            Accumulator::Tail(events) => View::Events(events.iter().cloned().collect()),
            Accumulator::Latest(event) => View::Latest(event.clone()),
            Accumulator::Count(n) => View::Count(*n),
            Accumulator::Sum(total) => View::Sum(*total),
        }
    }
}

fn keep_last(out: &mut VecDeque<Event>, n: usize, event: &Event) {
    if n == 0 {
        return;
    }
    out.push_back(event.clone());
    while out.len() > n {
        out.pop_front();
    }
}
