//! Event types the runtime itself emits.

pub const POLICY_CHECKED: &str = "policy.checked";
pub const POLICY_VIOLATION: &str = "policy.violation";
pub const TOOL_REQUEST: &str = "tool.request";
pub const TOOL_ERROR: &str = "tool.error";
pub const AGENT_REQUEST: &str = "agent.request";
pub const AGENT_ERROR: &str = "agent.error";
pub const HIL_REQUEST: &str = "hil.request";
pub const HIL_RESPONSE: &str = "hil.response";
pub const WORKFLOW_TIMED_OUT: &str = "workflow.timed_out";
pub const WORKFLOW_INVARIANT_VIOLATION: &str = "workflow.invariant_violation";
