//! Workflow instance identity and lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a workflow instance
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a workflow instance.
///
/// ```text
/// Pending → Running ⇄ Suspended
///              ↓          ↓
///   Completed | Failed | TimedOut
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    TimedOut,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed | InstanceState::Failed | InstanceState::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Suspended) | (Running, Completed) | (Running, Failed) | (Running, TimedOut) => true,
            (Suspended, Running) | (Suspended, Failed) | (Suspended, TimedOut) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Suspended => "suspended",
            InstanceState::Completed => "completed",
            InstanceState::Failed => "failed",
            InstanceState::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}
