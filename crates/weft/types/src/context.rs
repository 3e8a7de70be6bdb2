use std::sync::Arc;

use crate::event::{Event, EventId, TypePattern};

/// A frozen prefix of the event log.
///
/// The version of a context is its length. Prefixes share storage with the
/// context they were cut from; extending copies into a new allocation, so no
/// holder ever observes a change.
#[derive(Clone, Debug, Default)]
pub struct Context {
    events: Arc<Vec<Event>>,
    len: usize,
}

impl Context {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<Event>) -> Self {
        let len = events.len();
        Self {
            events: Arc::new(events),
            len,
        }
    }

    /// Share an already-built event vector. Used by the log to hand out snapshots
    /// without copying.
    pub fn from_shared(events: Arc<Vec<Event>>) -> Self {
        let len = events.len();
        Self { events, len }
    }

    pub fn version(&self) -> u64 {
        self.len as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn events(&self) -> &[Event] {
        &self.events[..self.len]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events().iter()
    }

    pub fn get(&self, index: usize) -> Option<&Event> {
        self.events().get(index)
    }

    pub fn last(&self) -> Option<&Event> {
        self.events().last()
    }

    /// The first `version` events. Versions past the end are clamped.
    pub fn prefix(&self, version: u64) -> Context {
        let len = (version as usize).min(self.len);
        Context {
            events: Arc::clone(&self.events),
            len,
        }
    }

    /// A new context consisting of this one followed by `more`.
    pub fn extended<I>(&self, more: I) -> Context
    where
        I: IntoIterator<Item = Event>,
    {
        let mut events = self.events().to_vec();
        events.extend(more);
        Context::from_events(events)
    }

    /// True when every event of `self` appears, in order, at the start of `other`.
    pub fn is_prefix_of(&self, other: &Context) -> bool {
        if self.len > other.len {
            return false;
        }
        if Arc::ptr_eq(&self.events, &other.events) {
            return true;
        }
        self.events()
            .iter()
            .zip(other.events())
            .all(|(a, b)| a.id == b.id)
    }

    pub fn position(&self, id: &EventId) -> Option<usize> {
        self.events().iter().position(|e| &e.id == id)
    }

    pub fn find(&self, id: &EventId) -> Option<&Event> {
        self.events().iter().find(|e| &e.id == id)
    }

    pub fn matching<'a>(&'a self, pattern: &'a TypePattern) -> impl Iterator<Item = &'a Event> {
        self.events().iter().filter(move |e| pattern.matches(&e.event_type))
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.events() == other.events()
    }
}

impl<'a> IntoIterator for &'a Context {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventData, EventType, Timestamp};

    fn ev(event_type: &str, ms: u64) -> Event {
        Event::seal(
            EventId::new(),
            EventType::parse(event_type).unwrap(),
            Timestamp::from_millis(ms),
            EventData::new(),
        )
    }

    #[test]
    fn prefix_keeps_first_events_only() {
        let ctx = Context::from_events(vec![ev("a.x", 1), ev("a.y", 2), ev("b.x", 3)]);
        let p = ctx.prefix(2);
        assert_eq!(p.version(), 2);
        assert_eq!(p.events(), &ctx.events()[..2]);
        assert!(p.is_prefix_of(&ctx));
        assert!(!ctx.is_prefix_of(&p));
    }

    #[test]
    fn prefix_past_end_is_clamped() {
        let ctx = Context::from_events(vec![ev("a.x", 1)]);
        assert_eq!(ctx.prefix(10).version(), 1);
    }

    #[test]
    fn extending_never_changes_the_original() {
        let ctx = Context::from_events(vec![ev("a.x", 1)]);
        let before = ctx.clone();
        let longer = ctx.extended(vec![ev("a.y", 2)]);
        assert_eq!(ctx, before);
        assert_eq!(ctx.version(), 1);
        assert_eq!(longer.version(), 2);
        assert!(ctx.is_prefix_of(&longer));
    }

    #[test]
    fn extending_a_prefix_diverges_from_the_parent() {
        let ctx = Context::from_events(vec![ev("a.x", 1), ev("a.y", 2)]);
        let forked = ctx.prefix(1).extended(vec![ev("a.z", 3)]);
        assert!(!forked.is_prefix_of(&ctx));
        assert_eq!(ctx.version(), 2);
    }

    #[test]
    fn matching_filters_by_pattern() {
        let ctx = Context::from_events(vec![ev("tool.request", 1), ev("user.query", 2)]);
        let pattern = TypePattern::parse("tool.*").unwrap();
        assert_eq!(ctx.matching(&pattern).count(), 1);
    }
}
