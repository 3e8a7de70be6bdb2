use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_types::{well_known, EventType};

/// The two kinds of external computation a workflow can call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Agent,
    Tool,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Agent => "agent",
            StepKind::Tool => "tool",
        }
    }

    /// Event type announcing a call of this kind (`tool.request`, `agent.request`).
    pub fn request_type(&self) -> EventType {
        match self {
            StepKind::Agent => EventType::well_known(well_known::AGENT_REQUEST),
            StepKind::Tool => EventType::well_known(well_known::TOOL_REQUEST),
        }
    }

    /// Event type recording a failed call of this kind.
    pub fn error_type(&self) -> EventType {
        match self {
            StepKind::Agent => EventType::well_known(well_known::AGENT_ERROR),
            StepKind::Tool => EventType::well_known(well_known::TOOL_ERROR),
        }
    }
}

/// Reference to an agent or tool by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepRef {
    pub kind: StepKind,
    pub name: String,
}

impl StepRef {
    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Agent,
            name: name.into(),
        }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Tool,
            name: name.into(),
        }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.name)
    }
}

/// Identity of one invocation slot: at most one call per key runs at a time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InFlightKey {
    pub instance: String,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl InFlightKey {
    pub fn new(instance: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            node: node.into(),
            iteration: None,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }
}

impl fmt::Display for InFlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iteration {
            Some(i) => write!(f, "{}/{}#{}", self.instance, self.node, i),
            None => write!(f, "{}/{}", self.instance, self.node),
        }
    }
}

/// How often a failed call is retried.
///
/// Only transient failures and timeouts are retried. The default is a single
/// attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff_ms * n`.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// Delay before the retry that follows attempt `attempt`. Saturates.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_ref_display_and_event_types() {
        let step = StepRef::tool("web_search");
        assert_eq!(step.to_string(), "tool:web_search");
        assert_eq!(step.kind.request_type().as_str(), "tool.request");
        assert_eq!(StepKind::Agent.error_type().as_str(), "agent.error");
    }

    #[test]
    fn in_flight_keys_differ_by_iteration() {
        let a = InFlightKey::new("i", "loop");
        let b = InFlightKey::new("i", "loop").with_iteration(1);
        assert_ne!(a, b);
        assert_eq!(b.to_string(), "i/loop#1");
    }

    #[test]
    fn retry_policy_defaults_to_one_attempt() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn backoff_grows_linearly_and_saturates() {
        let policy = RetryPolicy::attempts(3).with_backoff_ms(250);
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));

        let huge = RetryPolicy::attempts(u32::MAX).with_backoff_ms(u64::MAX / 2);
        assert_eq!(huge.backoff(3), Duration::from_millis(u64::MAX));
    }
}
