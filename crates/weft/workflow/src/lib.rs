//! Weft workflow definitions.
//!
//! A [`WorkflowDefinition`] is a DAG of [`Node`]s started by a [`Trigger`].
//! Node kinds are a closed set ([`NodeKind`]): agent and tool calls, parallel
//! fan-out, branches, bounded loops, human-in-the-loop suspension points and
//! a return value. Inputs are [`Template`]s rendered against the instance's
//! [`Bindings`].

pub mod condition;
pub mod definition;
pub mod error;
pub mod instance;
pub mod node;
pub mod template;

pub use condition::Condition;
pub use definition::{
    FieldMatch, Trigger, WorkflowDefinition, ITERATION_BINDING, PREV_BINDING, TRIGGER_BINDING,
};
pub use error::{WorkflowError, WorkflowResult};
pub use instance::{InstanceId, InstanceState};
pub use node::{BranchArm, LoopBody, Node, NodeId, NodeKind, OnError};
pub use template::{Bindings, Bound, Template};
