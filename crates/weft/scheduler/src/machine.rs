//! Instance state machine: the pure core of the scheduler.
//!
//! An [`Instance`] is a fold over the log events that carry its `_origin`
//! (plus the human responses that answer its requests). [`Instance::apply`]
//! folds one event; [`Instance::advance`] derives what can run next and
//! returns it as [`Action`]s for the driver to perform. Neither touches the
//! log, so live execution and replay go through exactly the same code.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use weft_invoker::{RetryPolicy, StepRef};
use weft_suspension::AwaitedResponse;
use weft_types::{well_known, Context, Event, EventId, EventType, Origin};
use weft_workflow::{
    Bound, Bindings, InstanceId, InstanceState, Node, NodeId, NodeKind, OnError,
    WorkflowDefinition, ITERATION_BINDING, PREV_BINDING, TRIGGER_BINDING,
};

use crate::error::{SchedulerError, SchedulerResult};

/// Per-node progress within one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Waiting,
    /// Invoked, forked, or waiting for a human.
    Started,
    Done,
    /// Rejected by policy and routed to its fallback.
    Diverted,
    /// Permanently ineligible for this instance.
    Skipped,
}

impl NodeStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            NodeStatus::Done | NodeStatus::Diverted | NodeStatus::Skipped
        )
    }
}

/// An agent or tool call the driver should perform.
#[derive(Clone, Debug, PartialEq)]
pub struct StepJob {
    pub node: NodeId,
    pub step: StepRef,
    pub input: Value,
    pub iteration: Option<u32>,
    pub retry: RetryPolicy,
    pub timeout_ms: Option<u64>,
    pub capabilities: Vec<String>,
}

/// A `hil.request` the driver should append.
#[derive(Clone, Debug, PartialEq)]
pub struct HumanRequest {
    pub node: NodeId,
    pub prompt: Value,
    pub response_type: EventType,
    pub timeout_ms: Option<u64>,
    pub default: Option<Value>,
}

/// Work derived by [`Instance::advance`].
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Invoke(StepJob),
    RequestHuman(HumanRequest),
    /// A scheduling invariant broke; the driver records it and the instance fails.
    Violation { node: NodeId, reason: String },
}

/// What a quiescent instance (nothing in flight, nothing to start) is.
#[derive(Clone, Debug, PartialEq)]
pub enum Settle {
    Finished,
    Suspend,
    Stuck { node: NodeId, reason: String },
}

enum Readiness {
    NotYet,
    Ready,
    Dead,
}

#[derive(Clone, Debug, Default)]
struct LoopProgress {
    completed: Option<u32>,
    last: Option<Event>,
    launched: Option<u32>,
}

/// Read-only summary of an instance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstanceReport {
    pub id: InstanceId,
    pub workflow: String,
    pub state: InstanceState,
    pub output: Option<Value>,
    pub failure: Option<String>,
    pub bindings: BTreeMap<String, Value>,
    pub nodes: BTreeMap<String, NodeStatus>,
    pub awaiting: Vec<AwaitedResponse>,
}

/// One execution of a workflow definition.
#[derive(Clone, Debug)]
pub struct Instance {
    id: InstanceId,
    workflow: Arc<WorkflowDefinition>,
    trigger: Event,
    state: InstanceState,
    status: Vec<NodeStatus>,
    index: HashMap<NodeId, usize>,
    selected: HashMap<usize, NodeId>,
    bindings: Bindings,
    loops: HashMap<usize, LoopProgress>,
    awaiting: Vec<AwaitedResponse>,
    output: Option<Value>,
    failure: Option<String>,
    applied: HashSet<EventId>,
}

impl Instance {
    pub fn new(id: InstanceId, workflow: Arc<WorkflowDefinition>, trigger: Event) -> Self {
        let mut bindings = Bindings::new();
        bindings.bind_event(TRIGGER_BINDING, trigger.clone());
        let index = workflow
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        Self {
            id,
            status: vec![NodeStatus::Waiting; workflow.nodes.len()],
            workflow,
            trigger,
            state: InstanceState::Pending,
            index,
            selected: HashMap::new(),
            bindings,
            loops: HashMap::new(),
            awaiting: Vec::new(),
            output: None,
            failure: None,
            applied: HashSet::new(),
        }
    }

    /// Rebuild an instance from a context. Only events tagged with this
    /// instance's id, and responses to its requests, are folded.
    pub fn replay(
        id: InstanceId,
        workflow: Arc<WorkflowDefinition>,
        trigger: Event,
        context: &Context,
    ) -> SchedulerResult<Self> {
        let mut instance = Self::new(id, workflow, trigger);
        instance.transition(InstanceState::Running)?;
        for event in context.iter() {
            instance.apply(event)?;
        }
        Ok(instance)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn workflow(&self) -> &Arc<WorkflowDefinition> {
        &self.workflow
    }

    pub fn trigger(&self) -> &Event {
        &self.trigger
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Every human request issued so far, answered or not.
    pub fn awaiting(&self) -> &[AwaitedResponse] {
        &self.awaiting
    }

    pub fn pending(&self) -> impl Iterator<Item = &AwaitedResponse> {
        self.awaiting.iter().filter(|a| !a.is_resolved())
    }

    pub fn node_status(&self, node: &str) -> Option<NodeStatus> {
        self.index.get(&NodeId::from(node)).map(|&i| self.status[i])
    }

    pub fn origin(&self, node: &NodeId, iteration: Option<u32>) -> Origin {
        let origin = Origin::new(self.id.as_str(), self.workflow.name.clone(), node.as_str());
        match iteration {
            Some(i) => origin.with_iteration(i),
            None => origin,
        }
    }

    pub fn report(&self) -> InstanceReport {
        InstanceReport {
            id: self.id.clone(),
            workflow: self.workflow.name.clone(),
            state: self.state,
            output: self.output.clone(),
            failure: self.failure.clone(),
            bindings: self.bindings.to_values(),
            nodes: self
                .workflow
                .nodes
                .iter()
                .zip(&self.status)
                .map(|(n, s)| (n.id.to_string(), *s))
                .collect(),
            awaiting: self.awaiting.clone(),
        }
    }

    // ── Transitions ──────────────────────────────────────────────────

    pub fn transition(&mut self, next: InstanceState) -> SchedulerResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                instance: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, state: InstanceState, reason: String) -> SchedulerResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.transition(state)?;
        self.failure = Some(reason);
        Ok(())
    }

    // ── Folding events ───────────────────────────────────────────────

    /// Fold one event. Returns whether it concerned this instance.
    /// Folding the same event twice is a no-op.
    pub fn apply(&mut self, event: &Event) -> SchedulerResult<bool> {
        if self.state.is_terminal() || self.applied.contains(&event.id) {
            return Ok(false);
        }
        // Gate markers carry the origin of the step they checked, not an output.
        if event.event_type.as_str() == well_known::POLICY_CHECKED {
            return Ok(false);
        }
        if self.answer(event) {
            self.applied.insert(event.id);
            return Ok(true);
        }

        let Some(origin) = event.origin().filter(|o| o.instance == self.id.as_str()) else {
            return Ok(false);
        };
        let Some(&idx) = self.index.get(&NodeId::new(origin.node.as_str())) else {
            return Ok(false);
        };
        self.applied.insert(event.id);

        let workflow = Arc::clone(&self.workflow);
        let node = &workflow.nodes[idx];
        let reason = || {
            event
                .get_str("reason")
                .or_else(|| event.get_str("error"))
                .unwrap_or("unspecified")
                .to_string()
        };

        match event.event_type.as_str() {
            well_known::HIL_REQUEST => {
                let response_type = event
                    .get_str("response_type")
                    .and_then(|raw| EventType::parse(raw).ok())
                    .unwrap_or_else(|| EventType::well_known(well_known::HIL_RESPONSE));
                self.awaiting.push(AwaitedResponse {
                    node: node.id.clone(),
                    request_id: event.id,
                    response_type,
                    deadline_ms: event.get("deadline_ms").and_then(Value::as_u64),
                    default: event.get("default").filter(|v| !v.is_null()).cloned(),
                    resolved_by: None,
                });
                self.status[idx] = NodeStatus::Started;
            }
            well_known::POLICY_VIOLATION => {
                let divert = event.get_str("on_violation") == Some("fallback") && node.fallback.is_some();
                self.awaiting.retain(|a| a.node != node.id || a.is_resolved());
                if divert {
                    self.bindings.bind_event(node.id.as_str(), event.clone());
                    self.status[idx] = NodeStatus::Diverted;
                    self.loops.remove(&idx);
                } else {
                    self.fail(
                        InstanceState::Failed,
                        format!("policy violation at {}: {}", node.id, reason()),
                    )?;
                }
            }
            well_known::TOOL_ERROR | well_known::AGENT_ERROR => {
                if node.on_error == OnError::Continue {
                    self.bindings.bind_event(node.id.as_str(), event.clone());
                    self.status[idx] = NodeStatus::Done;
                    self.loops.remove(&idx);
                } else {
                    let timed_out = event.get("timed_out") == Some(&Value::Bool(true));
                    let state = if timed_out {
                        InstanceState::TimedOut
                    } else {
                        InstanceState::Failed
                    };
                    self.fail(state, format!("step {} failed: {}", node.id, reason()))?;
                }
            }
            well_known::WORKFLOW_TIMED_OUT => {
                self.fail(
                    InstanceState::TimedOut,
                    format!("deadline of {} elapsed without a response", node.id),
                )?;
            }
            well_known::WORKFLOW_INVARIANT_VIOLATION => {
                self.fail(InstanceState::Failed, reason())?;
            }
            _ => self.record_output(idx, node, origin.iteration, event),
        }
        Ok(true)
    }

    fn record_output(&mut self, idx: usize, node: &Node, iteration: Option<u32>, event: &Event) {
        match self.status[idx] {
            NodeStatus::Diverted | NodeStatus::Skipped => return,
            NodeStatus::Done if matches!(node.kind, NodeKind::Loop { .. }) => return,
            _ => {}
        }
        // Human nodes are bound only by the response that answers their request.
        if matches!(node.kind, NodeKind::HumanInLoop { .. }) {
            return;
        }
        if matches!(node.kind, NodeKind::Loop { .. }) {
            let iteration = iteration.unwrap_or(0);
            let progress = self.loops.entry(idx).or_default();
            progress.completed = Some(progress.completed.map_or(iteration, |c| c.max(iteration)));
            progress.last = Some(event.clone());
            if progress.launched == Some(iteration) {
                progress.launched = None;
            }
            self.status[idx] = NodeStatus::Started;
        } else {
            self.bindings.bind_event(node.id.as_str(), event.clone());
            self.status[idx] = NodeStatus::Done;
        }
    }

    /// Bind a response to the request it cites, if this instance is waiting for it.
    fn answer(&mut self, event: &Event) -> bool {
        let Some(request_id) = event
            .get_str("request_id")
            .and_then(|raw| EventId::parse(raw).ok())
        else {
            return false;
        };
        let Some(entry) = self.awaiting.iter_mut().find(|a| {
            a.request_id == request_id && !a.is_resolved() && a.response_type == event.event_type
        }) else {
            return false;
        };
        entry.resolved_by = Some(event.id);
        let node = entry.node.clone();
        if let Some(&idx) = self.index.get(&node) {
            self.bindings.bind_event(node.as_str(), event.clone());
            self.status[idx] = NodeStatus::Done;
        }
        true
    }

    // ── Deriving work ────────────────────────────────────────────────

    /// Start everything that became eligible and resolve joins, branches,
    /// loop iterations and dead paths until nothing changes.
    pub fn advance(&mut self) -> SchedulerResult<Vec<Action>> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return Ok(actions);
        }
        if self.state == InstanceState::Pending {
            self.transition(InstanceState::Running)?;
        }

        let workflow = Arc::clone(&self.workflow);
        loop {
            let mut changed = false;
            for (i, node) in workflow.nodes.iter().enumerate() {
                if self.state.is_terminal() {
                    return Ok(actions);
                }
                match self.status[i] {
                    NodeStatus::Waiting => match self.readiness(&workflow, node) {
                        Readiness::NotYet => {}
                        Readiness::Dead => {
                            self.status[i] = NodeStatus::Skipped;
                            changed = true;
                        }
                        Readiness::Ready => {
                            self.start(i, node, &mut actions)?;
                            changed = true;
                        }
                    },
                    NodeStatus::Started => changed |= self.progress(i, node, &mut actions),
                    _ => {}
                }
            }
            if !changed {
                return Ok(actions);
            }
        }
    }

    fn readiness(&self, workflow: &WorkflowDefinition, node: &Node) -> Readiness {
        let deps = workflow.dependencies(node);
        if deps.is_empty() {
            return Readiness::Ready;
        }
        let block = workflow.enclosing_block(&node.id);
        let mut live = false;
        for dep in &deps {
            let Some(&d) = self.index.get(dep) else {
                return Readiness::Dead;
            };
            match self.status[d] {
                NodeStatus::Waiting => return Readiness::NotYet,
                NodeStatus::Started if Some(dep) == block => live = true,
                NodeStatus::Started => return Readiness::NotYet,
                NodeStatus::Done | NodeStatus::Diverted => {
                    live |= self.edge_live(&workflow.nodes[d], d, node);
                }
                NodeStatus::Skipped => {}
            }
        }
        if live {
            Readiness::Ready
        } else {
            Readiness::Dead
        }
    }

    /// Whether the resolved node `source` passes control to `target`.
    fn edge_live(&self, source: &Node, d: usize, target: &Node) -> bool {
        let is_fallback = source.fallback.as_ref() == Some(&target.id);
        match self.status[d] {
            NodeStatus::Diverted => is_fallback,
            NodeStatus::Done if is_fallback => false,
            NodeStatus::Done => match self.selected.get(&d) {
                Some(chosen) if source.gated_targets().contains(&&target.id) => *chosen == target.id,
                _ => true,
            },
            _ => false,
        }
    }

    fn start(&mut self, i: usize, node: &Node, actions: &mut Vec<Action>) -> SchedulerResult<()> {
        let id = node.id.clone();
        match &node.kind {
            NodeKind::Agent {
                agent,
                input,
                capabilities,
            } => {
                self.status[i] = NodeStatus::Started;
                actions.push(Action::Invoke(StepJob {
                    node: id,
                    step: StepRef::agent(agent.clone()),
                    input: input.render(&self.bindings),
                    iteration: None,
                    retry: node.retry.clone(),
                    timeout_ms: node.timeout_ms,
                    capabilities: capabilities.clone(),
                }));
            }
            NodeKind::Tool { tool, input } => {
                self.status[i] = NodeStatus::Started;
                actions.push(Action::Invoke(StepJob {
                    node: id,
                    step: StepRef::tool(tool.clone()),
                    input: input.render(&self.bindings),
                    iteration: None,
                    retry: node.retry.clone(),
                    timeout_ms: node.timeout_ms,
                    capabilities: Vec::new(),
                }));
            }
            NodeKind::Parallel { .. } | NodeKind::Loop { .. } => {
                self.status[i] = NodeStatus::Started;
            }
            NodeKind::Branch { on, arms, otherwise } => {
                let value = self.bindings.resolve(on).unwrap_or(Value::Null);
                let chosen = arms
                    .iter()
                    .find(|arm| arm.equals == value)
                    .map(|arm| arm.then.clone())
                    .or_else(|| otherwise.clone());
                match chosen {
                    Some(target) => {
                        self.bindings
                            .bind_value(id.as_str(), json!({ "value": value, "selected": target }));
                        self.selected.insert(i, target);
                        self.status[i] = NodeStatus::Done;
                    }
                    None => {
                        self.status[i] = NodeStatus::Started;
                        actions.push(Action::Violation {
                            reason: format!("branch {id}: no arm matches {value} and no otherwise is declared"),
                            node: id,
                        });
                    }
                }
            }
            NodeKind::HumanInLoop {
                prompt,
                response_type,
                default,
            } => {
                self.status[i] = NodeStatus::Started;
                actions.push(Action::RequestHuman(HumanRequest {
                    node: id,
                    prompt: prompt.render(&self.bindings),
                    response_type: response_type.clone(),
                    timeout_ms: node.timeout_ms,
                    default: default.clone(),
                }));
            }
            NodeKind::Return { value } => {
                let output = value.render(&self.bindings);
                self.bindings.bind_value(id.as_str(), output.clone());
                self.status[i] = NodeStatus::Done;
                self.output = Some(output);
                self.transition(InstanceState::Completed)?;
            }
        }
        Ok(())
    }

    /// Move a started parallel block or loop forward. Returns whether anything changed.
    fn progress(&mut self, i: usize, node: &Node, actions: &mut Vec<Action>) -> bool {
        match &node.kind {
            NodeKind::Parallel { members } => {
                let joined = members.iter().all(|m| {
                    self.index
                        .get(m)
                        .is_some_and(|&j| self.status[j].is_resolved())
                });
                if !joined {
                    return false;
                }
                let outputs: Map<String, Value> = members
                    .iter()
                    .map(|m| {
                        let value = self.bindings.get(m.as_str()).map_or(Value::Null, Bound::to_value);
                        (m.to_string(), value)
                    })
                    .collect();
                self.bindings.bind_value(node.id.as_str(), Value::Object(outputs));
                self.status[i] = NodeStatus::Done;
                true
            }
            NodeKind::Loop { body, max, until } => {
                let progress = self.loops.get(&i).cloned().unwrap_or_default();
                if progress.launched.is_some() {
                    return false;
                }

                if let Some(done) = progress.completed {
                    let mut scope = self.bindings.clone();
                    if let Some(last) = &progress.last {
                        scope.bind_event(PREV_BINDING, last.clone());
                        scope.bind_event(node.id.as_str(), last.clone());
                    }
                    scope.bind_value(ITERATION_BINDING, json!(done));
                    let satisfied = until.as_ref().is_some_and(|c| c.evaluate(&scope));
                    if satisfied || done + 1 >= *max {
                        if let Some(last) = progress.last {
                            self.bindings.bind_event(node.id.as_str(), last);
                        }
                        self.status[i] = NodeStatus::Done;
                        return true;
                    }
                }

                let next = progress.completed.map_or(0, |done| done + 1);
                let mut scope = self.bindings.clone();
                match &progress.last {
                    Some(last) => scope.bind_event(PREV_BINDING, last.clone()),
                    None => scope.bind_value(PREV_BINDING, Value::Null),
                }
                scope.bind_value(ITERATION_BINDING, json!(next));
                actions.push(Action::Invoke(StepJob {
                    node: node.id.clone(),
                    step: body.step.clone(),
                    input: body.input.render(&scope),
                    iteration: Some(next),
                    retry: node.retry.clone(),
                    timeout_ms: node.timeout_ms,
                    capabilities: Vec::new(),
                }));
                self.loops.entry(i).or_default().launched = Some(next);
                true
            }
            _ => false,
        }
    }

    /// Classify an instance that has nothing in flight and nothing to start.
    pub fn settle(&mut self) -> SchedulerResult<Settle> {
        if self.state.is_terminal() {
            return Ok(Settle::Finished);
        }
        if self.pending().next().is_some() {
            return Ok(Settle::Suspend);
        }
        let unresolved: Vec<&NodeId> = self
            .workflow
            .nodes
            .iter()
            .zip(&self.status)
            .filter(|(_, s)| !s.is_resolved())
            .map(|(n, _)| &n.id)
            .collect();
        match unresolved.first() {
            None => {
                self.transition(InstanceState::Completed)?;
                Ok(Settle::Finished)
            }
            Some(first) => Ok(Settle::Stuck {
                node: (*first).clone(),
                reason: format!(
                    "nodes {} can never become eligible",
                    unresolved
                        .iter()
                        .map(|n| n.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }),
        }
    }
}
