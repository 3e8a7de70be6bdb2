use thiserror::Error;
use weft_types::Timestamp;

/// Errors from event log operations.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL corruption in segment {segment} at offset {offset}: {reason}")]
    Corruption {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("WAL segment not found: {0}")]
    SegmentNotFound(u64),

    #[error("event integrity verification failed for event {event_id}")]
    IntegrityFailure { event_id: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("event time {supplied} is earlier than the last logged time {last}")]
    NonMonotonicTime { last: Timestamp, supplied: Timestamp },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        LogError::Serialization(e.to_string())
    }
}

pub type LogResult<T> = Result<T, LogError>;
