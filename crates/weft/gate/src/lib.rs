//! Weft policy gate.
//!
//! Every candidate event passes a fixed, fail-closed pipeline before it may
//! become visible in the log:
//!
//! 1. **Deny**: any matching deny rule rejects; deny wins over allow
//! 2. **Allow**: subjects (tool, capability, type, field) must be allow-listed
//!    when the policy lists allow rules of that kind
//! 3. **Validation**: per-tool input constraints (max length, pattern, deny-list)
//! 4. **Limits**: budgets folded from prior events in the context; a breach
//!    rejects, never clamps
//!
//! [`check`] is the pure decision. [`PolicyGate`] applies it to the live log:
//! admitted candidates are appended right after a `policy.checked` event,
//! rejected ones are replaced by a `policy.violation` event.

pub mod check;
pub mod error;
pub mod gate;
pub mod policy;
pub mod stages;

pub use check::{check, check_all, Verdict};
pub use error::{GateError, GateResult};
pub use gate::{Admission, GateConfig, PolicyGate, Preflight};
pub use policy::{
    Constraint, Limit, LimitScope, Measure, OnViolation, Policy, Rule, Selector, Validation,
};
pub use stages::{
    AllowStage, CheckStage, DenyStage, LimitStage, Rejection, StageResult, Subject,
    ValidationStage, PREFLIGHT_PHASE,
};
