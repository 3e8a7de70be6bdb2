//! Workflow definitions: the DAG a workflow instance executes.
//!
//! Definitions are plain data, already parsed by whoever authored them. They
//! are validated once, on registration, and never change afterwards.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::{Event, TypePattern};

use crate::node::{Node, NodeId, NodeKind};
use crate::{WorkflowError, WorkflowResult};

/// Binding name of the event that started the instance.
pub const TRIGGER_BINDING: &str = "trigger";
/// Binding name of the previous loop iteration's output.
pub const PREV_BINDING: &str = "prev";
/// Binding name of the current loop iteration index.
pub const ITERATION_BINDING: &str = "iteration";

const RESERVED: [&str; 3] = [TRIGGER_BINDING, PREV_BINDING, ITERATION_BINDING];

// ── Trigger ──────────────────────────────────────────────────────────

/// Additional equality test on a trigger event's data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub field: String,
    pub equals: Value,
}

/// Which initiating events start an instance of a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub pattern: TypePattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<FieldMatch>,
}

impl Trigger {
    pub fn on(pattern: TypePattern) -> Self {
        Self {
            pattern,
            matches: None,
        }
    }

    pub fn when_field(mut self, field: impl Into<String>, equals: impl Into<Value>) -> Self {
        self.matches = Some(FieldMatch {
            field: field.into(),
            equals: equals.into(),
        });
        self
    }

    pub fn accepts(&self, event: &Event) -> bool {
        self.pattern.matches(&event.event_type)
            && self
                .matches
                .as_ref()
                .map_or(true, |m| event.field(&m.field) == Some(&m.equals))
    }
}

// ── Workflow Definition ──────────────────────────────────────────────

fn default_version() -> u32 {
    1
}

/// A named DAG of nodes started by a trigger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub when: Trigger,
    pub nodes: Vec<Node>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, when: Trigger) -> Self {
        Self {
            name: name.into(),
            version: 1,
            when,
            nodes: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Get a node by ID
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// The parallel block `id` is a member of.
    pub fn enclosing_block(&self, id: &NodeId) -> Option<&NodeId> {
        self.nodes.iter().find_map(|n| match &n.kind {
            NodeKind::Parallel { members } if members.contains(id) => Some(&n.id),
            _ => None,
        })
    }

    /// Declared needs plus the enclosing parallel block, without duplicates.
    pub fn dependencies(&self, node: &Node) -> Vec<NodeId> {
        let mut deps = node.needs.clone();
        if let Some(block) = self.enclosing_block(&node.id) {
            if !deps.contains(block) {
                deps.push(block.clone());
            }
        }
        deps
    }

    pub fn return_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Return { .. }))
    }

    /// Validate the definition for structural correctness.
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.nodes.is_empty() {
            return Err(WorkflowError::Empty);
        }
        if self.name.trim().is_empty() {
            return Err(WorkflowError::ValidationError("workflow name is empty".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if RESERVED.contains(&node.id.as_str()) {
                return Err(WorkflowError::ReservedNodeId(node.id.clone()));
            }
            if !seen.insert(&node.id) {
                return Err(WorkflowError::DuplicateNodeId(node.id.clone()));
            }
        }

        let unknown = |node: &Node, reference: &NodeId| WorkflowError::UnknownReference {
            node: node.id.clone(),
            reference: reference.to_string(),
        };

        let mut membership: HashMap<&NodeId, &NodeId> = HashMap::new();
        for node in &self.nodes {
            for need in &node.needs {
                if !seen.contains(need) {
                    return Err(unknown(node, need));
                }
            }

            match &node.kind {
                NodeKind::Parallel { members } => {
                    if members.is_empty() {
                        return Err(WorkflowError::ValidationError(format!(
                            "parallel block {} has no members",
                            node.id
                        )));
                    }
                    for member in members {
                        let invalid = |reason: &str| WorkflowError::InvalidParallelMember {
                            block: node.id.clone(),
                            member: member.clone(),
                            reason: reason.to_string(),
                        };
                        if !seen.contains(member) {
                            return Err(invalid("not a node of this workflow"));
                        }
                        if member == &node.id {
                            return Err(invalid("a block cannot contain itself"));
                        }
                        if membership.insert(member, &node.id).is_some() {
                            return Err(invalid("already a member of another block"));
                        }
                    }
                }
                NodeKind::Loop { max: 0, .. } => {
                    return Err(WorkflowError::ZeroIterationLoop(node.id.clone()));
                }
                _ => {}
            }

            let branch_targets: Vec<&NodeId> = match &node.kind {
                NodeKind::Branch { arms, otherwise, .. } => {
                    arms.iter().map(|a| &a.then).chain(otherwise.iter()).collect()
                }
                _ => Vec::new(),
            };
            let targets = branch_targets
                .into_iter()
                .map(|t| (t, false))
                .chain(node.fallback.iter().map(|t| (t, true)));
            for (target, is_fallback) in targets {
                if !seen.contains(target) {
                    return Err(unknown(node, target));
                }
                if self.get(target).is_some_and(|t| t.needs.contains(&node.id)) {
                    continue;
                }
                return Err(if is_fallback {
                    WorkflowError::DetachedFallback {
                        node: node.id.clone(),
                        fallback: target.clone(),
                    }
                } else {
                    WorkflowError::DetachedBranchTarget {
                        branch: node.id.clone(),
                        target: target.clone(),
                    }
                });
            }

            let in_loop = matches!(node.kind, NodeKind::Loop { .. });
            for name in node.referenced_bindings() {
                let known = name == TRIGGER_BINDING
                    || (in_loop && (name == PREV_BINDING || name == ITERATION_BINDING))
                    || seen.contains(&NodeId::new(name.as_str()));
                if !known {
                    return Err(WorkflowError::UnknownReference {
                        node: node.id.clone(),
                        reference: name,
                    });
                }
            }
        }

        let returns = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Return { .. }))
            .count();
        if returns > 1 {
            return Err(WorkflowError::MultipleReturns);
        }

        self.topological_order().map(|_| ())
    }

    /// Nodes in an order where every node follows its dependencies and every
    /// parallel block's dependents follow all of its members.
    ///
    /// Kahn's algorithm over a graph in which each parallel block is split
    /// into a fork vertex (before its members) and a join vertex (after them).
    pub fn topological_order(&self) -> WorkflowResult<Vec<NodeId>> {
        let n = self.nodes.len();
        let index: HashMap<&NodeId, usize> =
            self.nodes.iter().enumerate().map(|(i, node)| (&node.id, i)).collect();
        let is_block = |i: usize| matches!(self.nodes[i].kind, NodeKind::Parallel { .. });
        // Vertex a node's dependents wait on: the join for blocks.
        let output = |i: usize| if is_block(i) { n + i } else { i };

        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); 2 * n];
        let mut indegree = vec![0usize; 2 * n];
        let mut add = |from: usize, to: usize, edges: &mut Vec<Vec<usize>>| {
            edges[from].push(to);
            indegree[to] += 1;
        };

        for (i, node) in self.nodes.iter().enumerate() {
            let block = self.enclosing_block(&node.id).and_then(|b| index.get(b).copied());
            for dep in self.dependencies(node) {
                let Some(&d) = index.get(&dep) else {
                    return Err(WorkflowError::UnknownReference {
                        node: node.id.clone(),
                        reference: dep.to_string(),
                    });
                };
                let from = if Some(d) == block { d } else { output(d) };
                add(from, i, &mut edges);
            }
            if let NodeKind::Parallel { members } = &node.kind {
                add(i, n + i, &mut edges);
                for member in members {
                    if let Some(&m) = index.get(member) {
                        add(output(m), n + i, &mut edges);
                    }
                }
            }
        }

        let vertices: Vec<usize> = (0..n).chain((0..n).filter(|&i| is_block(i)).map(|i| n + i)).collect();
        let mut queue: VecDeque<usize> = vertices.iter().copied().filter(|&v| indegree[v] == 0).collect();
        let mut order = Vec::with_capacity(n);
        let mut visited = 0;

        while let Some(v) = queue.pop_front() {
            visited += 1;
            if v < n {
                order.push(self.nodes[v].id.clone());
            }
            for &next in &edges[v] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited != vertices.len() {
            let stuck = vertices
                .iter()
                .filter(|&&v| indegree[v] > 0 && v < n)
                .map(|&v| self.nodes[v].id.clone())
                .collect();
            return Err(WorkflowError::CycleDetected(stuck));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use serde_json::json;
    use weft_invoker::StepRef;
    use weft_types::{EventData, EventId, EventType, Timestamp, ValuePath};

    fn trigger() -> Trigger {
        Trigger::on(TypePattern::parse("user.query").unwrap())
    }

    fn research() -> WorkflowDefinition {
        WorkflowDefinition::new("research", trigger())
            .node(Node::parallel("gather", ["web", "arxiv"]))
            .node(Node::tool("web", "web_search", json!({"q": "${trigger.topic}"})))
            .node(Node::tool("arxiv", "arxiv_search", json!({"q": "${trigger.topic}"})))
            .node(Node::agent("synthesis", "writer", json!({"web": "${web}", "papers": "${arxiv}"})).needs(["gather"]))
            .node(Node::returns("done", json!("${synthesis.text}")).needs(["synthesis"]))
    }

    #[test]
    fn valid_definition_orders_join_before_dependents() {
        let def = research();
        def.validate().unwrap();
        let order = def.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|n| n.as_str() == id).unwrap();
        assert!(pos("gather") < pos("web"));
        assert!(pos("web") < pos("synthesis"));
        assert!(pos("arxiv") < pos("synthesis"));
        assert!(pos("synthesis") < pos("done"));
    }

    #[test]
    fn cycles_are_rejected() {
        let def = WorkflowDefinition::new("loopy", trigger())
            .node(Node::tool("a", "t", json!({})).needs(["b"]))
            .node(Node::tool("b", "t", json!({})).needs(["a"]));
        assert!(matches!(def.validate(), Err(WorkflowError::CycleDetected(_))));
    }

    #[test]
    fn member_waiting_on_block_dependent_is_a_cycle() {
        let def = WorkflowDefinition::new("deadlock", trigger())
            .node(Node::parallel("p", ["m"]))
            .node(Node::tool("m", "t", json!({})).needs(["after"]))
            .node(Node::tool("after", "t", json!({})).needs(["p"]));
        assert!(matches!(def.validate(), Err(WorkflowError::CycleDetected(_))));
    }

    #[test]
    fn structural_errors() {
        let empty = WorkflowDefinition::new("e", trigger());
        assert_eq!(empty.validate(), Err(WorkflowError::Empty));

        let dup = WorkflowDefinition::new("d", trigger())
            .node(Node::tool("a", "t", json!({})))
            .node(Node::tool("a", "t", json!({})));
        assert!(matches!(dup.validate(), Err(WorkflowError::DuplicateNodeId(_))));

        let reserved = WorkflowDefinition::new("r", trigger()).node(Node::tool("trigger", "t", json!({})));
        assert!(matches!(reserved.validate(), Err(WorkflowError::ReservedNodeId(_))));

        let unknown = WorkflowDefinition::new("u", trigger()).node(Node::tool("a", "t", json!({})).needs(["ghost"]));
        assert!(matches!(unknown.validate(), Err(WorkflowError::UnknownReference { .. })));

        let bad_ref = WorkflowDefinition::new("u", trigger()).node(Node::tool("a", "t", json!("${ghost.x}")));
        assert!(matches!(bad_ref.validate(), Err(WorkflowError::UnknownReference { .. })));

        let prev_outside_loop = WorkflowDefinition::new("u", trigger()).node(Node::tool("a", "t", json!("${prev}")));
        assert!(prev_outside_loop.validate().is_err());

        let zero = WorkflowDefinition::new("z", trigger()).node(Node::looped(
            "l",
            StepRef::agent("x"),
            json!({}),
            0,
            None,
        ));
        assert_eq!(zero.validate(), Err(WorkflowError::ZeroIterationLoop(NodeId::from("l"))));

        let two_returns = WorkflowDefinition::new("t", trigger())
            .node(Node::returns("a", json!(1)))
            .node(Node::returns("b", json!(2)));
        assert_eq!(two_returns.validate(), Err(WorkflowError::MultipleReturns));

        let not_a_member = WorkflowDefinition::new("p", trigger()).node(Node::parallel("p", ["ghost"]));
        assert!(matches!(
            not_a_member.validate(),
            Err(WorkflowError::InvalidParallelMember { .. })
        ));
    }

    #[test]
    fn branch_targets_and_fallbacks_must_need_their_source() {
        let on = ValuePath::parse("trigger.kind").unwrap();
        let detached = WorkflowDefinition::new("b", trigger())
            .node(Node::branch("route", on.clone(), vec![(json!("a"), "a")], None))
            .node(Node::tool("a", "t", json!({})));
        assert!(matches!(
            detached.validate(),
            Err(WorkflowError::DetachedBranchTarget { .. })
        ));

        let attached = WorkflowDefinition::new("b", trigger())
            .node(Node::branch("route", on, vec![(json!("a"), "a")], Some("other")))
            .node(Node::tool("a", "t", json!({})).needs(["route"]))
            .node(Node::tool("other", "t", json!({})).needs(["route"]));
        attached.validate().unwrap();

        let fallback = WorkflowDefinition::new("f", trigger())
            .node(Node::tool("risky", "t", json!({})).with_fallback("safe"))
            .node(Node::tool("safe", "t", json!({})));
        assert!(matches!(
            fallback.validate(),
            Err(WorkflowError::DetachedFallback { .. })
        ));
    }

    #[test]
    fn loops_may_reference_prev_and_iteration() {
        let def = WorkflowDefinition::new("l", trigger()).node(Node::looped(
            "refine",
            StepRef::agent("critic"),
            json!({"draft": "${prev.text}", "round": "${iteration}"}),
            3,
            Some(Condition::truthy(ValuePath::parse("prev.accepted").unwrap())),
        ));
        def.validate().unwrap();
    }

    #[test]
    fn trigger_matches_type_and_field() {
        let mut data = EventData::new();
        data.insert("channel".into(), json!("support"));
        let event = Event::seal(
            EventId::new(),
            EventType::parse("message.incoming").unwrap(),
            Timestamp::from_millis(1),
            data,
        );
        let any = Trigger::on(TypePattern::parse("message.*").unwrap());
        assert!(any.accepts(&event));
        assert!(any.clone().when_field("channel", "support").accepts(&event));
        assert!(!any.when_field("channel", "sales").accepts(&event));
    }

    #[test]
    fn definition_loads_from_toml() {
        let raw = r#"
            name = "triage"
            when = { pattern = "message.incoming" }

            [[nodes]]
            id = "classify"
            kind = "agent"
            agent = "classifier"
            input = { text = "${trigger.text}" }

            [[nodes]]
            id = "route"
            kind = "branch"
            needs = ["classify"]
            on = "classify.label"
            otherwise = "reply"
            arms = [{ equals = "urgent", then = "review" }]

            [[nodes]]
            id = "review"
            kind = "human_in_loop"
            needs = ["route"]
            prompt = "Escalate ${trigger.text}?"
            timeout_ms = 3600000
            default = "reject"

            [[nodes]]
            id = "reply"
            kind = "tool"
            tool = "send_reply"
            needs = ["route"]
        "#;
        let def: WorkflowDefinition = toml::from_str(raw).unwrap();
        assert_eq!(def.version, 1);
        assert_eq!(def.nodes.len(), 4);
        def.validate().unwrap();
    }
}
