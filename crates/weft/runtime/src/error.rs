use thiserror::Error;
use weft_gate::GateError;
use weft_log::LogError;
use weft_scheduler::SchedulerError;
use weft_suspension::SuspensionError;

/// Errors from assembling or operating the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("suspension store error: {0}")]
    Suspension(#[from] SuspensionError),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
