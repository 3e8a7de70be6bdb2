use weft_types::{Context, Event};

/// A lazy, restartable, finite read over a fixed log snapshot.
///
/// Appends that happen after the cursor was created are never observed;
/// call [`crate::EventLog::read`] again for a newer view.
#[derive(Clone, Debug)]
pub struct LogCursor {
    snapshot: Context,
    start: usize,
    position: usize,
}

impl LogCursor {
    pub(crate) fn new(snapshot: Context, from_version: u64) -> Self {
        let start = (from_version as usize).min(snapshot.len());
        Self {
            snapshot,
            start,
            position: start,
        }
    }

    /// Rewind to the version the cursor was opened at.
    pub fn restart(&mut self) {
        self.position = self.start;
    }

    /// Version of the next event this cursor yields.
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// The snapshot this cursor reads from.
    pub fn snapshot(&self) -> &Context {
        &self.snapshot
    }

    pub fn remaining(&self) -> usize {
        self.snapshot.len() - self.position
    }
}

impl Iterator for LogCursor {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let event = self.snapshot.get(self.position)?.clone();
        self.position += 1;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl ExactSizeIterator for LogCursor {}
