//! Weft event log: the single source of truth.
//!
//! Every state change in the runtime is an immutable [`Event`] appended here.
//! The log provides:
//! - Crash-recoverable persistence via a segmented WAL with all-or-nothing frames
//! - Total order and monotonic time via a hybrid logical clock
//! - Frozen snapshots ([`Context`]) and restartable cursors for readers
//! - Push delivery of new events to pattern subscribers
//! - Integrity verification and JSON-lines export for audit

pub mod clock;
pub mod cursor;
pub mod error;
pub mod router;
pub mod types;
pub mod wal;

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use weft_types::{CandidateEvent, Context, Event, EventId, TypePattern};

pub use clock::{HybridClock, ManualTimeSource, SystemTimeSource, TimeSource};
pub use cursor::LogCursor;
pub use error::{LogError, LogResult};
pub use router::SubscriptionRouter;
pub use types::{IntegrityReport, SubscriptionId};
pub use wal::{FileStorage, MemoryStorage, SyncMode, WalConfig, WalStorage, WriteAheadLog};

/// Configuration for the event log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// WAL data directory (None = in-memory)
    pub data_dir: Option<PathBuf>,
    pub wal: WalConfig,
    /// Capacity of each subscriber channel.
    pub subscriber_buffer: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            wal: WalConfig::default(),
            subscriber_buffer: 1024,
        }
    }
}

/// Append-only, totally ordered event log.
///
/// Appends are serialized; reads work on snapshots and never block on a
/// writer beyond swapping the published event list.
pub struct EventLog {
    clock: HybridClock,
    wal: WriteAheadLog,
    router: SubscriptionRouter,
    writer: Mutex<()>,
    published: RwLock<Arc<Vec<Event>>>,
}

impl EventLog {
    /// Open the log described by `config` using the system clock.
    pub async fn open(config: LogConfig) -> LogResult<Self> {
        Self::open_with_clock(config, HybridClock::system()).await
    }

    pub async fn open_with_clock(config: LogConfig, clock: HybridClock) -> LogResult<Self> {
        let storage: Box<dyn WalStorage> = match &config.data_dir {
            Some(dir) => Box::new(FileStorage::new(dir.clone())?),
            None => Box::new(MemoryStorage::new()),
        };
        Self::open_with_storage(config, storage, clock).await
    }

    /// Volatile log with the system clock.
    pub async fn in_memory() -> LogResult<Self> {
        Self::open(LogConfig::default()).await
    }

    pub async fn open_with_storage(
        config: LogConfig,
        storage: Box<dyn WalStorage>,
        clock: HybridClock,
    ) -> LogResult<Self> {
        let (wal, recovered) = WriteAheadLog::open(config.wal.clone(), storage)?;

        for pair in recovered.windows(2) {
            if pair[1].time < pair[0].time {
                return Err(LogError::NonMonotonicTime {
                    last: pair[0].time,
                    supplied: pair[1].time,
                });
            }
        }
        if let Some(last) = recovered.last() {
            clock.observe(last.time);
        }

        info!(
            durable = config.data_dir.is_some(),
            version = recovered.len(),
            "Event log opened"
        );

        Ok(Self {
            clock,
            wal,
            router: SubscriptionRouter::new(config.subscriber_buffer),
            writer: Mutex::new(()),
            published: RwLock::new(Arc::new(recovered)),
        })
    }

    /// Append one candidate. See [`EventLog::append_all`].
    pub async fn append(&self, candidate: CandidateEvent) -> LogResult<Event> {
        let mut events = self.append_all(vec![candidate]).await?;
        events
            .pop()
            .ok_or_else(|| LogError::Backend("append produced no event".into()))
    }

    /// Append candidates atomically and contiguously.
    ///
    /// Each candidate gets a fresh id; candidates without a time get the next
    /// clock tick. A supplied time earlier than the preceding event's time
    /// rejects the whole group and nothing is recorded. The group is written
    /// as one WAL frame and becomes visible to readers in one step.
    pub async fn append_all(&self, candidates: Vec<CandidateEvent>) -> LogResult<Vec<Event>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let _writer = self.writer.lock().await;
        let current = self.published_events();
        let first_version = current.len() as u64 + 1;
        let mut last_time = current.last().map(|e| e.time);

        let mut events = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let time = match candidate.time {
                Some(supplied) => {
                    if let Some(last) = last_time.filter(|last| supplied < *last) {
                        return Err(LogError::NonMonotonicTime { last, supplied });
                    }
                    supplied
                }
                None => self.clock.now(),
            };
            last_time = Some(time);
            events.push(Event::seal(
                EventId::new(),
                candidate.event_type,
                time,
                candidate.data,
            ));
        }

        self.wal.append_frame(first_version, &events)?;
        if let Some(last) = events.last() {
            self.clock.observe(last.time);
        }

        {
            let mut published = self.published.write().unwrap_or_else(PoisonError::into_inner);
            Arc::make_mut(&mut published).extend(events.iter().cloned());
        }

        for (offset, event) in events.iter().enumerate() {
            debug!(
                version = first_version + offset as u64,
                event_type = %event.event_type,
                time = %event.time,
                "Event appended"
            );
        }

        self.router.route(&events).await;
        Ok(events)
    }

    fn published_events(&self) -> Arc<Vec<Event>> {
        Arc::clone(&self.published.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// The log as it is right now, frozen.
    pub fn snapshot(&self) -> Context {
        Context::from_shared(self.published_events())
    }

    /// Number of events in the log.
    pub fn version(&self) -> u64 {
        self.published_events().len() as u64
    }

    /// Events from `from_version` (0-based index of the first event to yield)
    /// onwards, over the current snapshot.
    pub fn read(&self, from_version: u64) -> LogCursor {
        LogCursor::new(self.snapshot(), from_version)
    }

    /// Receive every event appended from now on whose type matches `pattern`.
    pub async fn subscribe(&self, pattern: TypePattern) -> (SubscriptionId, mpsc::Receiver<Event>) {
        self.router.subscribe(pattern).await
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) {
        self.router.unsubscribe(id).await
    }

    pub fn clock(&self) -> &HybridClock {
        &self.clock
    }

    /// Physical time of the log's time source, in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.clock.wall_ms()
    }

    /// Verify WAL checksums and event hashes.
    pub fn verify(&self) -> LogResult<IntegrityReport> {
        let report = self.wal.verify_integrity()?;
        info!(
            total = report.total_events,
            corrupted = report.corrupted_events,
            "Log integrity verified"
        );
        Ok(report)
    }

    /// Flush the WAL to stable storage and return the durable version.
    pub async fn checkpoint(&self) -> LogResult<u64> {
        let _writer = self.writer.lock().await;
        self.wal.sync()?;
        let version = self.version();
        info!(version, "Checkpoint created");
        Ok(version)
    }

    /// Write the full log as JSON lines. Returns the number of events written.
    pub fn export_jsonl<W: std::io::Write>(&self, mut writer: W) -> LogResult<u64> {
        let snapshot = self.snapshot();
        for event in snapshot.iter() {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(snapshot.version())
    }
}
