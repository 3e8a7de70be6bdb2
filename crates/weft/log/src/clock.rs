use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use weft_types::Timestamp;

/// Source of physical time in milliseconds.
///
/// The runtime reads time only through this trait so tests can drive
/// deadlines deterministically.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced time for tests.
#[derive(Clone, Debug, Default)]
pub struct ManualTimeSource {
    now: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hybrid logical clock over a [`TimeSource`].
///
/// Every timestamp handed out by [`HybridClock::now`] is strictly greater
/// than every timestamp previously handed out or observed.
pub struct HybridClock {
    last: Mutex<Timestamp>,
    source: Arc<dyn TimeSource>,
}

impl HybridClock {
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self {
            last: Mutex::new(Timestamp::ZERO),
            source,
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemTimeSource))
    }

    pub fn source(&self) -> &Arc<dyn TimeSource> {
        &self.source
    }

    /// Physical milliseconds of the underlying source, without ticking the clock.
    pub fn wall_ms(&self) -> u64 {
        self.source.now_ms()
    }

    /// Generate a new timestamp.
    pub fn now(&self) -> Timestamp {
        let wall = self.source.now_ms();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = if wall > last.physical_ms {
            Timestamp::new(wall, 0)
        } else {
            Timestamp::new(last.physical_ms, last.logical.saturating_add(1))
        };
        *last = next;
        next
    }

    /// Advance the clock to a timestamp supplied from outside
    /// (an explicit candidate time, or the tail of a recovered log).
    pub fn observe(&self, seen: Timestamp) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if seen > *last {
            *last = seen;
        }
    }
}
