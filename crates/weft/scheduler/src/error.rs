use thiserror::Error;
use weft_gate::GateError;
use weft_log::LogError;
use weft_suspension::SuspensionError;
use weft_types::TypeError;
use weft_workflow::{InstanceId, InstanceState, WorkflowError};

/// Errors from the workflow scheduler.
///
/// Workflow-level failures (policy violations, step failures, timeouts,
/// invariant violations) are events in the log, not errors; these are the
/// failures of the scheduler itself.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("workflow already registered: {0}")]
    DuplicateWorkflow(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("invalid transition for {instance}: {from} -> {to}")]
    InvalidTransition {
        instance: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("replay failed for {instance}: {reason}")]
    Replay { instance: InstanceId, reason: String },

    #[error("invalid workflow: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("suspension store error: {0}")]
    Suspension(#[from] SuspensionError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
