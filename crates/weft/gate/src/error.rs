use thiserror::Error;
use weft_log::LogError;
use weft_types::TypeError;

/// Errors from the policy gate.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("invalid policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },

    #[error("duplicate policy name: {0}")]
    DuplicatePolicy(String),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

pub type GateResult<T> = Result<T, GateError>;
