//! Weft step invoker.
//!
//! The only place where the runtime calls out to agents and tools. A step
//! gets a frozen [`Context`](weft_types::Context) and an input value and
//! returns candidate events; nothing else crosses the boundary.
//!
//! [`StepInvoker`] enforces at most one outstanding call per
//! `(instance, node, iteration)`, a global concurrency bound, per-attempt
//! deadlines and retry of transient failures.

pub mod backend;
pub mod error;
pub mod invoker;
pub mod step;

pub use backend::{HandlerRegistry, StepBackend};
pub use error::{ErrorKind, InvocationError, InvokeError, InvokeResult};
pub use invoker::{Invocation, InvokerConfig, StepCall, StepInvoker};
pub use step::{InFlightKey, RetryPolicy, StepKind, StepRef};
