//! Weft workflow scheduler.
//!
//! Runs workflow instances as folds over the event log. The pure core is
//! [`Instance`]: it folds the events an instance produced and derives the
//! next [`Action`]s (invoke a step, request human input, record an
//! invariant violation). [`Scheduler`] performs those actions through the
//! policy gate, the step invoker and the log, suspends instances waiting
//! for humans and resumes them from nothing but the log prefix and their
//! [`SuspensionRecord`](weft_suspension::SuspensionRecord).
//!
//! Because live execution and replay share the same fold, an instance
//! rebuilt from the log after a restart is indistinguishable from one that
//! never stopped.

pub mod error;
pub mod machine;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use machine::{Action, HumanRequest, Instance, InstanceReport, NodeStatus, Settle, StepJob};
pub use scheduler::{Resumption, Scheduler, SchedulerConfig, TriggerOutcome};
