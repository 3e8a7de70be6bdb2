use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::{InFlightKey, StepRef};

/// Whether a failed invocation is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Failure reported by a step backend.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?} invocation failure: {message}")]
pub struct InvocationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl InvocationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Errors from the step invoker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("step already in flight: {0}")]
    AlreadyInFlight(InFlightKey),

    #[error("step {step} timed out after {timeout_ms}ms ({attempts} attempt(s))")]
    Timeout {
        step: StepRef,
        timeout_ms: u64,
        attempts: u32,
    },

    #[error("step {step} failed after {attempts} attempt(s): {source}")]
    Failed {
        step: StepRef,
        attempts: u32,
        #[source]
        source: InvocationError,
    },

    #[error("step {0} produced no events")]
    EmptyOutput(StepRef),

    #[error("invoker is shut down")]
    Closed,
}

impl InvokeError {
    pub fn attempts(&self) -> u32 {
        match self {
            InvokeError::Timeout { attempts, .. } | InvokeError::Failed { attempts, .. } => *attempts,
            InvokeError::EmptyOutput(_) => 1,
            InvokeError::AlreadyInFlight(_) | InvokeError::Closed => 0,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, InvokeError::Timeout { .. })
    }
}

pub type InvokeResult<T> = Result<T, InvokeError>;
