use thiserror::Error;

/// Errors raised while constructing data-model values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid event type '{value}': {reason}")]
    InvalidEventType { value: String, reason: String },

    #[error("invalid type pattern '{0}'")]
    InvalidPattern(String),

    #[error("invalid value path '{0}'")]
    InvalidPath(String),

    #[error("invalid event id '{0}'")]
    InvalidEventId(String),
}
