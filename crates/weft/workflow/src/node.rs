use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_invoker::{RetryPolicy, StepRef};
use weft_types::{well_known, EventType, ValuePath};

use crate::condition::Condition;
use crate::template::Template;

// ── Identifiers ──────────────────────────────────────────────────────

/// Identifier of a node, unique within its workflow.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ── Node kinds ───────────────────────────────────────────────────────

/// One arm of a branch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchArm {
    pub equals: Value,
    pub then: NodeId,
}

/// The single step a loop repeats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopBody {
    #[serde(flatten)]
    pub step: StepRef,
    /// May reference `${prev}` (previous iteration's output) and `${iteration}`.
    #[serde(default)]
    pub input: Template,
}

fn hil_response() -> EventType {
    EventType::well_known(well_known::HIL_RESPONSE)
}

/// The fixed set of node kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Agent {
        agent: String,
        #[serde(default)]
        input: Template,
        /// Declared capabilities, checked by the policy gate.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        capabilities: Vec<String>,
    },
    Tool {
        tool: String,
        #[serde(default)]
        input: Template,
    },
    /// Runs `members` concurrently and binds once all of them are resolved.
    Parallel { members: Vec<NodeId> },
    /// Activates the first arm equal to the value at `on`, else `otherwise`.
    Branch {
        on: ValuePath,
        arms: Vec<BranchArm>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<NodeId>,
    },
    /// Repeats `body` sequentially up to `max` times or until `until` holds.
    Loop {
        body: LoopBody,
        max: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<Condition>,
    },
    /// Asks a human and suspends until the response arrives or the node's
    /// `timeout_ms` passes.
    HumanInLoop {
        prompt: Template,
        #[serde(default = "hil_response")]
        response_type: EventType,
        /// Response value synthesized when the deadline passes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    /// Ends the instance with a value.
    Return { value: Template },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Agent { .. } => "agent",
            NodeKind::Tool { .. } => "tool",
            NodeKind::Parallel { .. } => "parallel",
            NodeKind::Branch { .. } => "branch",
            NodeKind::Loop { .. } => "loop",
            NodeKind::HumanInLoop { .. } => "human_in_loop",
            NodeKind::Return { .. } => "return",
        }
    }

    /// The agent or tool this node calls, if it calls one directly.
    pub fn step(&self) -> Option<StepRef> {
        match self {
            NodeKind::Agent { agent, .. } => Some(StepRef::agent(agent.clone())),
            NodeKind::Tool { tool, .. } => Some(StepRef::tool(tool.clone())),
            NodeKind::Loop { body, .. } => Some(body.step.clone()),
            _ => None,
        }
    }
}

/// What happens when a node's agent or tool call fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// The instance fails.
    #[default]
    Fail,
    /// The error event is bound as the node's output and the workflow continues.
    Continue,
}

// ── Node ─────────────────────────────────────────────────────────────

/// A node of the workflow graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Nodes whose outputs this node waits for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<NodeId>,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt deadline of an agent or tool call, or the deadline of a
    /// human response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_error: OnError,
    /// Node activated instead of this node's dependents when a policy
    /// rejects this node with `on_violation = "fallback"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<NodeId>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(id),
            needs: Vec::new(),
            kind,
            retry: RetryPolicy::default(),
            timeout_ms: None,
            on_error: OnError::Fail,
            fallback: None,
        }
    }

    pub fn agent(id: impl Into<String>, agent: impl Into<String>, input: Value) -> Self {
        Self::new(
            id,
            NodeKind::Agent {
                agent: agent.into(),
                input: Template(input),
                capabilities: Vec::new(),
            },
        )
    }

    pub fn tool(id: impl Into<String>, tool: impl Into<String>, input: Value) -> Self {
        Self::new(
            id,
            NodeKind::Tool {
                tool: tool.into(),
                input: Template(input),
            },
        )
    }

    pub fn parallel<I, S>(id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            NodeKind::Parallel {
                members: members.into_iter().map(|m| NodeId::new(m)).collect(),
            },
        )
    }

    pub fn branch(id: impl Into<String>, on: ValuePath, arms: Vec<(Value, &str)>, otherwise: Option<&str>) -> Self {
        Self::new(
            id,
            NodeKind::Branch {
                on,
                arms: arms
                    .into_iter()
                    .map(|(equals, then)| BranchArm {
                        equals,
                        then: NodeId::from(then),
                    })
                    .collect(),
                otherwise: otherwise.map(NodeId::from),
            },
        )
    }

    pub fn looped(id: impl Into<String>, step: StepRef, input: Value, max: u32, until: Option<Condition>) -> Self {
        Self::new(
            id,
            NodeKind::Loop {
                body: LoopBody {
                    step,
                    input: Template(input),
                },
                max,
                until,
            },
        )
    }

    pub fn human(id: impl Into<String>, prompt: Value, timeout_ms: Option<u64>, default: Option<Value>) -> Self {
        let mut node = Self::new(
            id,
            NodeKind::HumanInLoop {
                prompt: Template(prompt),
                response_type: hil_response(),
                default,
            },
        );
        node.timeout_ms = timeout_ms;
        node
    }

    pub fn returns(id: impl Into<String>, value: Value) -> Self {
        Self::new(id, NodeKind::Return { value: Template(value) })
    }

    pub fn needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs.extend(needs.into_iter().map(|n| NodeId::new(n)));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(NodeId::new(fallback));
        self
    }

    /// Nodes this node selects between when it resolves: branch arms and
    /// `otherwise`, plus the fallback. Edges to them are only live when chosen.
    pub fn gated_targets(&self) -> Vec<&NodeId> {
        let mut targets = Vec::new();
        if let NodeKind::Branch { arms, otherwise, .. } = &self.kind {
            targets.extend(arms.iter().map(|a| &a.then));
            targets.extend(otherwise.iter());
        }
        targets.extend(self.fallback.iter());
        targets
    }

    /// Binding names referenced by this node's templates and conditions.
    pub fn referenced_bindings(&self) -> Vec<String> {
        let names = |t: &Template| -> Vec<String> {
            t.references()
                .into_iter()
                .map(|r| r.split('.').next().unwrap_or_default().to_string())
                .collect()
        };
        match &self.kind {
            NodeKind::Agent { input, .. } | NodeKind::Tool { input, .. } => names(input),
            NodeKind::Loop { body, until, .. } => {
                let mut refs = names(&body.input);
                if let Some(until) = until {
                    refs.extend(until.bindings().into_iter().map(str::to_string));
                }
                refs
            }
            NodeKind::HumanInLoop { prompt, .. } => names(prompt),
            NodeKind::Return { value } => names(value),
            NodeKind::Branch { on, .. } => vec![on.binding().to_string()],
            NodeKind::Parallel { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nodes_deserialize_from_flat_tables() {
        let raw = json!({
            "id": "search",
            "kind": "tool",
            "tool": "web_search",
            "input": {"q": "${trigger.topic}"},
            "needs": ["plan"],
            "retry": {"max_attempts": 3},
            "on_error": "continue"
        });
        let node: Node = serde_json::from_value(raw).unwrap();
        assert_eq!(node.kind.step(), Some(StepRef::tool("web_search")));
        assert_eq!(node.retry.max_attempts, 3);
        assert_eq!(node.on_error, OnError::Continue);
        assert_eq!(node.referenced_bindings(), vec!["trigger"]);
    }

    #[test]
    fn hil_defaults_to_hil_response() {
        let raw = json!({"id": "review", "kind": "human_in_loop", "prompt": "ok?", "timeout_ms": 1000});
        let node: Node = serde_json::from_value(raw).unwrap();
        assert_eq!(node.timeout_ms, Some(1000));
        let NodeKind::HumanInLoop { response_type, default, .. } = node.kind else {
            panic!("expected human_in_loop");
        };
        assert_eq!(response_type.as_str(), "hil.response");
        assert_eq!(default, None);
    }

    #[test]
    fn loop_body_flattens_step_ref() {
        let raw = json!({
            "id": "refine",
            "kind": "loop",
            "max": 3,
            "body": {"kind": "agent", "name": "critic", "input": {"draft": "${prev.text}"}},
            "until": {"op": "truthy", "path": "prev.accepted"}
        });
        let node: Node = serde_json::from_value(raw).unwrap();
        assert_eq!(node.kind.step(), Some(StepRef::agent("critic")));
        let mut refs = node.referenced_bindings();
        refs.sort();
        assert_eq!(refs, vec!["prev", "prev"]);
    }

    #[test]
    fn gated_targets_cover_arms_otherwise_and_fallback() {
        let node = Node::branch(
            "route",
            ValuePath::parse("review.value").unwrap(),
            vec![(json!("approve"), "publish")],
            Some("discard"),
        )
        .with_fallback("manual");
        let targets: Vec<_> = node.gated_targets().into_iter().map(NodeId::as_str).collect();
        assert_eq!(targets, vec!["publish", "discard", "manual"]);
    }
}
