use thiserror::Error;
use weft_workflow::InstanceId;

/// Errors from suspension stores.
#[derive(Error, Debug)]
pub enum SuspensionError {
    #[error("no suspension record for instance {0}")]
    NotFound(InstanceId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for SuspensionError {
    fn from(e: serde_json::Error) -> Self {
        SuspensionError::Serialization(e.to_string())
    }
}

pub type SuspensionResult<T> = Result<T, SuspensionError>;
