use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use weft_gate::{Admission, PolicyGate, Preflight};
use weft_invoker::{InFlightKey, StepCall, StepInvoker};
use weft_log::EventLog;
use weft_suspension::{
    AwaitedResponse, Resolution, SuspensionError, SuspensionRecord, SuspensionStore,
};
use weft_types::{well_known, CandidateEvent, Context, Event, EventId, EventType, Origin};
use weft_workflow::{InstanceId, InstanceState, WorkflowDefinition};

use crate::error::{SchedulerError, SchedulerResult};
use crate::machine::{Action, HumanRequest, Instance, InstanceReport, Settle, StepJob};

/// Configuration for the workflow scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the background timer loop checks HIL deadlines.
    pub timer_interval_ms: u64,
    /// Reports of finished instances kept for [`Scheduler::instance`].
    pub finished_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timer_interval_ms: 1_000,
            finished_capacity: 1_024,
        }
    }
}

/// Result of submitting a trigger event.
#[derive(Clone, Debug)]
pub enum TriggerOutcome {
    /// The trigger was rejected by policy; no instance started.
    Rejected { violation: Event },
    /// The trigger is in the log; one report per workflow it started.
    Started {
        trigger: Event,
        instances: Vec<InstanceReport>,
    },
}

/// Result of delivering a response to a suspended instance.
#[derive(Clone, Debug)]
pub enum Resumption {
    Resumed(InstanceReport),
    /// The request was already answered; nothing was applied.
    AlreadyResolved,
    /// The response does not answer anything the instance waits for.
    Mismatch(String),
    NotSuspended,
    /// The response itself was rejected by policy.
    Rejected { violation: Event },
}

type Slot = Arc<Mutex<Option<Instance>>>;
type SlotGuard = OwnedMutexGuard<Option<Instance>>;

/// Reports of terminal instances, oldest first.
#[derive(Default)]
struct Finished {
    order: VecDeque<InstanceId>,
    reports: HashMap<InstanceId, InstanceReport>,
}

/// Drives workflow instances against the event log.
///
/// Everything an instance does goes through the log: step outputs and
/// responses are admitted by the gate, bookkeeping events (`hil.request`,
/// step errors, timeouts, invariant violations) are appended directly.
/// An instance's state is always the fold of its events, so suspension
/// needs nothing beyond the log and a [`SuspensionRecord`].
pub struct Scheduler {
    log: Arc<EventLog>,
    gate: Arc<PolicyGate>,
    invoker: Arc<StepInvoker>,
    suspensions: Arc<dyn SuspensionStore>,
    workflows: RwLock<Vec<Arc<WorkflowDefinition>>>,
    instances: RwLock<HashMap<InstanceId, Slot>>,
    finished: StdMutex<Finished>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        gate: Arc<PolicyGate>,
        invoker: Arc<StepInvoker>,
        suspensions: Arc<dyn SuspensionStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            log: Arc::clone(gate.log()),
            gate,
            invoker,
            suspensions,
            workflows: RwLock::new(Vec::new()),
            instances: RwLock::new(HashMap::new()),
            finished: StdMutex::new(Finished::default()),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn gate(&self) -> &Arc<PolicyGate> {
        &self.gate
    }

    pub fn suspensions(&self) -> &Arc<dyn SuspensionStore> {
        &self.suspensions
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Validate and register a workflow definition.
    ///
    /// A definition that fails validation is recorded in the log as a
    /// `workflow.invariant_violation` and refused.
    pub async fn register(&self, definition: WorkflowDefinition) -> SchedulerResult<()> {
        if let Err(err) = definition.validate() {
            warn!(workflow = %definition.name, error = %err, "Workflow rejected");
            self.log
                .append(
                    CandidateEvent::new(EventType::well_known(well_known::WORKFLOW_INVARIANT_VIOLATION))
                        .with("workflow", definition.name.clone())
                        .with("reason", err.to_string())
                        .with("phase", "registration"),
                )
                .await?;
            return Err(err.into());
        }

        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        if workflows.iter().any(|w| w.name == definition.name) {
            return Err(SchedulerError::DuplicateWorkflow(definition.name));
        }
        info!(
            workflow = %definition.name,
            version = definition.version,
            nodes = definition.nodes.len(),
            "Workflow registered"
        );
        workflows.push(Arc::new(definition));
        Ok(())
    }

    pub fn workflow(&self, name: &str) -> SchedulerResult<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|w| w.name == name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownWorkflow(name.to_string()))
    }

    pub fn workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Instances ────────────────────────────────────────────────────

    /// Lock the slot of `id`, creating it if needed. Every caller hands the
    /// guard back through [`Scheduler::release`].
    async fn lock(&self, id: &InstanceId) -> (Slot, SlotGuard) {
        let slot = {
            let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(instances.entry(id.clone()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        (slot, guard)
    }

    /// Unlock a slot, dropping it from the table when it holds nothing.
    fn release(&self, id: &InstanceId, slot: &Slot, guard: SlotGuard) {
        if guard.is_none() {
            let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
            if instances.get(id).is_some_and(|held| Arc::ptr_eq(held, slot)) {
                instances.remove(id);
            }
        }
        drop(guard);
    }

    /// Store a quiescent instance in its slot. Terminal instances leave the
    /// table: their report moves to the finished cache and their
    /// per-instance policy views are dropped.
    fn park(&self, guard: &mut SlotGuard, instance: Instance) -> InstanceReport {
        let report = instance.report();
        if instance.state().is_terminal() {
            self.gate.forget_instance(instance.id().as_str());
            self.retire(report.clone());
            **guard = None;
        } else {
            **guard = Some(instance);
        }
        report
    }

    fn retire(&self, report: InstanceReport) {
        let capacity = self.config.finished_capacity;
        if capacity == 0 {
            return;
        }
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        let id = report.id.clone();
        if finished.reports.insert(id.clone(), report).is_none() {
            finished.order.push_back(id);
        }
        while finished.order.len() > capacity {
            if let Some(oldest) = finished.order.pop_front() {
                finished.reports.remove(&oldest);
            }
        }
    }

    /// The live instance, or the report of a recently finished one.
    pub async fn instance(&self, id: &InstanceId) -> Option<InstanceReport> {
        let slot = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        if let Some(slot) = slot {
            if let Some(instance) = slot.lock().await.as_ref() {
                return Some(instance.report());
            }
        }
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reports
            .get(id)
            .cloned()
    }

    /// Instances that are running or suspended.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    // ── Triggers ─────────────────────────────────────────────────────

    /// Admit an initiating event and start every workflow whose `when` accepts it.
    ///
    /// Returns once each started instance is quiescent: terminal or suspended.
    pub async fn trigger(&self, candidate: CandidateEvent) -> SchedulerResult<TriggerOutcome> {
        match self.gate.submit(candidate).await? {
            Admission::Rejected { violation, .. } => Ok(TriggerOutcome::Rejected { violation }),
            Admission::Admitted { event, .. } => {
                let instances = self.dispatch(&event).await?;
                Ok(TriggerOutcome::Started {
                    trigger: event,
                    instances,
                })
            }
        }
    }

    /// Start every registered workflow that accepts `trigger`, an event already in the log.
    pub async fn dispatch(&self, trigger: &Event) -> SchedulerResult<Vec<InstanceReport>> {
        let matching: Vec<_> = self
            .workflows()
            .into_iter()
            .filter(|w| w.when.accepts(trigger))
            .collect();
        if matching.is_empty() {
            debug!(event_type = %trigger.event_type, "No workflow accepts trigger");
        }
        futures::future::try_join_all(matching.into_iter().map(|w| self.start(w, trigger.clone()))).await
    }

    async fn start(&self, workflow: Arc<WorkflowDefinition>, trigger: Event) -> SchedulerResult<InstanceReport> {
        let id = InstanceId::generate();
        let (slot, mut guard) = self.lock(&id).await;
        info!(
            instance = %id,
            workflow = %workflow.name,
            trigger = %trigger.id,
            "Instance started"
        );
        let mut instance = Instance::new(id.clone(), workflow, trigger);
        let report = match self.drive(&mut instance).await {
            Ok(()) => Ok(self.park(&mut guard, instance)),
            Err(err) => Err(err),
        };
        self.release(&id, &slot, guard);
        report
    }

    // ── Driving ──────────────────────────────────────────────────────

    /// Run an instance until it is terminal or suspended.
    #[instrument(skip(self, instance), fields(instance = %instance.id()))]
    async fn drive(&self, instance: &mut Instance) -> SchedulerResult<()> {
        let mut running = FuturesUnordered::new();
        loop {
            for action in instance.advance()? {
                match action {
                    Action::Invoke(job) => {
                        let origin = instance.origin(&job.node, job.iteration);
                        running.push(self.run_step(origin, job));
                    }
                    Action::RequestHuman(request) => {
                        let event = self.request_human(instance, request).await?;
                        instance.apply(&event)?;
                    }
                    Action::Violation { node, reason } => {
                        let origin = instance.origin(&node, None);
                        let event = self.record_invariant_violation(&origin, &reason).await?;
                        instance.apply(&event)?;
                    }
                }
            }

            if instance.state().is_terminal() {
                break;
            }
            if let Some(events) = running.next().await {
                for event in events? {
                    instance.apply(&event)?;
                }
                continue;
            }

            match instance.settle()? {
                Settle::Finished => break,
                Settle::Suspend => {
                    if self.catch_up(instance)? {
                        continue;
                    }
                    self.suspend(instance).await?;
                    if self.resume_logged(instance).await? {
                        continue;
                    }
                    return Ok(());
                }
                Settle::Stuck { node, reason } => {
                    let origin = instance.origin(&node, None);
                    let event = self.record_invariant_violation(&origin, &reason).await?;
                    instance.apply(&event)?;
                }
            }
        }

        if !running.is_empty() {
            debug!(abandoned = running.len(), "Dropping in-flight steps of a finished instance");
        }
        self.suspensions.remove(instance.id()).await?;
        info!(
            instance = %instance.id(),
            state = %instance.state(),
            failure = instance.failure().unwrap_or_default(),
            "Instance finished"
        );
        Ok(())
    }

    /// Invoke one step and admit what it produced.
    ///
    /// The request is preflighted and never appended; the outputs are
    /// submitted one by one and the first rejection stops the rest.
    async fn run_step(&self, origin: Origin, job: StepJob) -> SchedulerResult<Vec<Event>> {
        let kind = job.step.kind;
        let mut request = CandidateEvent::new(kind.request_type())
            .with(kind.as_str(), job.step.name.clone())
            .with("input", job.input.clone());
        if !job.capabilities.is_empty() {
            request = request.with("capability", job.capabilities.clone());
        }
        let request = request.with_origin(&origin);
        if let Preflight::Rejected { violation, .. } = self.gate.preflight(&request).await? {
            return Ok(vec![violation]);
        }

        let mut key = InFlightKey::new(origin.instance.clone(), origin.node.clone());
        if let Some(iteration) = job.iteration {
            key = key.with_iteration(iteration);
        }
        let call = StepCall::new(key, job.step.clone(), self.log.snapshot(), job.input)
            .retry(job.retry)
            .timeout_ms(job.timeout_ms);

        match self.invoker.invoke(call).await {
            Ok(invocation) => {
                let mut admitted = Vec::with_capacity(invocation.events.len());
                for mut candidate in invocation.events {
                    if candidate.get(kind.as_str()).is_none() {
                        candidate = candidate.with(kind.as_str(), job.step.name.clone());
                    }
                    match self.gate.submit(candidate.with_origin(&origin)).await? {
                        Admission::Admitted { event, .. } => admitted.push(event),
                        Admission::Rejected { violation, .. } => {
                            admitted.push(violation);
                            break;
                        }
                    }
                }
                Ok(admitted)
            }
            Err(err) => {
                warn!(step = %job.step, node = %origin.node, error = %err, "Step failed");
                let event = self
                    .log
                    .append(
                        CandidateEvent::new(kind.error_type())
                            .with(kind.as_str(), job.step.name.clone())
                            .with("error", err.to_string())
                            .with("attempts", err.attempts())
                            .with("timed_out", err.is_timeout())
                            .with_origin(&origin),
                    )
                    .await?;
                Ok(vec![event])
            }
        }
    }

    async fn request_human(&self, instance: &Instance, request: HumanRequest) -> SchedulerResult<Event> {
        let origin = instance.origin(&request.node, None);
        let deadline_ms = request
            .timeout_ms
            .map(|timeout| self.log.now_ms().saturating_add(timeout));

        let mut candidate = CandidateEvent::new(EventType::well_known(well_known::HIL_REQUEST))
            .with("prompt", request.prompt)
            .with("response_type", request.response_type.to_string());
        if let Some(deadline_ms) = deadline_ms {
            candidate = candidate.with("deadline_ms", deadline_ms);
        }
        if let Some(default) = request.default {
            candidate = candidate.with("default", default);
        }
        let event = self.log.append(candidate.with_origin(&origin)).await?;
        info!(
            instance = %instance.id(),
            node = %request.node,
            request = %event.id,
            deadline_ms,
            "Human input requested"
        );
        Ok(event)
    }

    async fn record_invariant_violation(&self, origin: &Origin, reason: &str) -> SchedulerResult<Event> {
        warn!(
            instance = %origin.instance,
            node = %origin.node,
            reason,
            "Scheduling invariant violated"
        );
        Ok(self
            .log
            .append(
                CandidateEvent::new(EventType::well_known(well_known::WORKFLOW_INVARIANT_VIOLATION))
                    .with("workflow", origin.workflow.clone())
                    .with("reason", reason)
                    .with("phase", "scheduling")
                    .with_origin(origin),
            )
            .await?)
    }

    /// Apply responses that reached the log while the instance was still running.
    fn catch_up(&self, instance: &mut Instance) -> SchedulerResult<bool> {
        let snapshot = self.log.snapshot();
        let pending: Vec<AwaitedResponse> = instance.pending().cloned().collect();
        let mut applied = false;
        for entry in pending {
            if let Some(response) = logged_response(&snapshot, &entry) {
                applied |= instance.apply(&response)?;
            }
        }
        Ok(applied)
    }

    async fn suspend(&self, instance: &mut Instance) -> SchedulerResult<()> {
        instance.transition(InstanceState::Suspended)?;
        let record = SuspensionRecord {
            instance: instance.id().clone(),
            workflow: instance.workflow().name.clone(),
            workflow_version: instance.workflow().version,
            trigger_id: instance.trigger().id,
            context_version: self.log.version(),
            suspended_at_ms: self.log.now_ms(),
            awaiting: instance.awaiting().to_vec(),
        };
        info!(
            instance = %record.instance,
            context_version = record.context_version,
            awaiting = record.pending().count(),
            "Instance suspended"
        );
        self.suspensions.save(record).await?;
        Ok(())
    }

    /// Resume from a response that reached the log while the suspension
    /// record was being saved. Its sender may have looked for the record
    /// before it existed.
    async fn resume_logged(&self, instance: &mut Instance) -> SchedulerResult<bool> {
        let snapshot = self.log.snapshot();
        let Some(response) = instance
            .pending()
            .find_map(|entry| logged_response(&snapshot, entry))
        else {
            return Ok(false);
        };
        match self.suspensions.resolve(instance.id(), &response).await? {
            Resolution::Resolved(entry) => {
                info!(
                    instance = %instance.id(),
                    node = %entry.node,
                    response = %response.id,
                    "Response arrived while suspending"
                );
                instance.transition(InstanceState::Running)?;
                instance.apply(&response)?;
                Ok(true)
            }
            Resolution::AlreadyResolved(_) | Resolution::Mismatch(_) => Ok(false),
        }
    }

    // ── Replay and resumption ────────────────────────────────────────

    /// Rebuild an instance of `workflow` from `context`.
    pub fn replay(
        &self,
        workflow: &str,
        instance: InstanceId,
        trigger: &EventId,
        context: &Context,
    ) -> SchedulerResult<Instance> {
        let definition = self.workflow(workflow)?;
        let trigger = context
            .find(trigger)
            .cloned()
            .ok_or_else(|| SchedulerError::Replay {
                instance: instance.clone(),
                reason: format!("trigger {trigger} is not in the context"),
            })?;
        Instance::replay(instance, definition, trigger, context)
    }

    /// Rebuild a suspended instance from the log prefix at suspension plus
    /// the responses its record says were accepted.
    fn rebuild(&self, record: &SuspensionRecord, incoming: Option<&Event>) -> SchedulerResult<Instance> {
        let definition = self.workflow(&record.workflow)?;
        if definition.version != record.workflow_version {
            warn!(
                instance = %record.instance,
                workflow = %record.workflow,
                suspended = record.workflow_version,
                registered = definition.version,
                "Resuming under a different workflow version"
            );
        }

        let snapshot = self.log.snapshot();
        let trigger = snapshot
            .find(&record.trigger_id)
            .cloned()
            .ok_or_else(|| SchedulerError::Replay {
                instance: record.instance.clone(),
                reason: format!("trigger {} is missing from the log", record.trigger_id),
            })?;

        let prefix = snapshot.prefix(record.context_version);
        let mut responses = Vec::new();
        for id in record.awaiting.iter().filter_map(|a| a.resolved_by) {
            if prefix.position(&id).is_some() {
                continue;
            }
            let response = snapshot
                .find(&id)
                .or_else(|| incoming.filter(|e| e.id == id))
                .cloned()
                .ok_or_else(|| SchedulerError::Replay {
                    instance: record.instance.clone(),
                    reason: format!("response {id} is missing from the log"),
                })?;
            responses.push(response);
        }
        responses.sort_by_key(|e| snapshot.position(&e.id).unwrap_or(usize::MAX));

        Instance::replay(
            record.instance.clone(),
            definition,
            trigger,
            &prefix.extended(responses),
        )
    }

    /// Deliver a response event (already in the log) to a suspended instance.
    ///
    /// Resolving the same request twice is a no-op.
    pub async fn resolve(&self, instance: &InstanceId, response: &Event) -> SchedulerResult<Resumption> {
        let (slot, mut guard) = self.lock(instance).await;
        let resumption = self.resolve_locked(&mut guard, instance, response).await;
        self.release(instance, &slot, guard);
        resumption
    }

    async fn resolve_locked(
        &self,
        guard: &mut SlotGuard,
        id: &InstanceId,
        response: &Event,
    ) -> SchedulerResult<Resumption> {
        let record = match self.suspensions.load(id).await {
            Ok(record) => record,
            Err(SuspensionError::NotFound(_)) => return Ok(Resumption::NotSuspended),
            Err(err) => return Err(err.into()),
        };
        match self.suspensions.resolve(id, response).await? {
            Resolution::AlreadyResolved(entry) => {
                debug!(instance = %id, request = %entry.request_id, "Response already applied");
                return Ok(Resumption::AlreadyResolved);
            }
            Resolution::Mismatch(reason) => return Ok(Resumption::Mismatch(reason)),
            Resolution::Resolved(entry) => {
                info!(
                    instance = %id,
                    node = %entry.node,
                    request = %entry.request_id,
                    response = %response.id,
                    "Instance resumed"
                );
            }
        }

        let record = self.suspensions.load(id).await.unwrap_or(record);
        let mut instance = self.rebuild(&record, Some(response))?;
        self.drive(&mut instance).await?;
        Ok(Resumption::Resumed(self.park(guard, instance)))
    }

    /// Answer an instance's pending request with `value`.
    pub async fn respond(
        &self,
        id: &InstanceId,
        request_id: EventId,
        value: Value,
    ) -> SchedulerResult<Resumption> {
        let (slot, mut guard) = self.lock(id).await;
        let resumption = self.respond_locked(&mut guard, id, request_id, value).await;
        self.release(id, &slot, guard);
        resumption
    }

    async fn respond_locked(
        &self,
        guard: &mut SlotGuard,
        id: &InstanceId,
        request_id: EventId,
        value: Value,
    ) -> SchedulerResult<Resumption> {
        let record = match self.suspensions.load(id).await {
            Ok(record) => record,
            Err(SuspensionError::NotFound(_)) => return Ok(Resumption::NotSuspended),
            Err(err) => return Err(err.into()),
        };
        let Some(entry) = record.awaiting.iter().find(|a| a.request_id == request_id) else {
            return Ok(Resumption::Mismatch(format!(
                "instance {id} is not waiting for request {request_id}"
            )));
        };
        if entry.is_resolved() {
            return Ok(Resumption::AlreadyResolved);
        }

        // No origin: a rejected answer must not count against the waiting node.
        let candidate = CandidateEvent::new(entry.response_type.clone())
            .with("request_id", request_id.to_string())
            .with("value", value);
        match self.gate.submit(candidate).await? {
            Admission::Admitted { event, .. } => self.resolve_locked(guard, id, &event).await,
            Admission::Rejected { violation, .. } => Ok(Resumption::Rejected { violation }),
        }
    }

    /// Route a response event from the log to the instance waiting for it.
    ///
    /// The target is found through the request's origin in the log, so a
    /// response racing the instance's suspension waits for the instance's
    /// lock instead of being dropped. Returns `None` when no known request
    /// matches.
    pub async fn handle_response(&self, response: &Event) -> SchedulerResult<Option<Resumption>> {
        let Some(request_id) = response
            .get_str("request_id")
            .and_then(|raw| EventId::parse(raw).ok())
        else {
            return Ok(None);
        };
        let instance = match response.origin() {
            Some(origin) => InstanceId::new(origin.instance),
            None => match self.requester(&request_id).await? {
                Some(instance) => instance,
                None => return Ok(None),
            },
        };
        self.resolve(&instance, response).await.map(Some)
    }

    /// The instance that issued `request_id`.
    async fn requester(&self, request_id: &EventId) -> SchedulerResult<Option<InstanceId>> {
        let logged = self
            .log
            .snapshot()
            .find(request_id)
            .filter(|e| e.event_type.as_str() == well_known::HIL_REQUEST)
            .and_then(Event::origin);
        if let Some(origin) = logged {
            return Ok(Some(InstanceId::new(origin.instance)));
        }
        Ok(self.suspensions.find_request(request_id).await?)
    }

    // ── Deadlines and recovery ───────────────────────────────────────

    /// Resolve every awaited response whose deadline has passed: with the
    /// configured default when there is one, otherwise by timing the
    /// instance out.
    pub async fn fire_timers(&self) -> SchedulerResult<Vec<InstanceReport>> {
        let now = self.log.now_ms();
        let due = self.suspensions.due(now).await?;
        let mut fired = Vec::new();

        for (id, entry) in due {
            let (slot, mut guard) = self.lock(&id).await;
            let report = self.fire_locked(&mut guard, &id, entry, now).await;
            self.release(&id, &slot, guard);
            fired.extend(report?);
        }
        Ok(fired)
    }

    async fn fire_locked(
        &self,
        guard: &mut SlotGuard,
        id: &InstanceId,
        entry: AwaitedResponse,
        now: u64,
    ) -> SchedulerResult<Option<InstanceReport>> {
        let record = match self.suspensions.load(id).await {
            Ok(record) => record,
            Err(SuspensionError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if !record.awaiting.iter().any(|a| a.request_id == entry.request_id && a.is_due(now)) {
            return Ok(None);
        }

        if let Some(response) = logged_response(&self.log.snapshot(), &entry) {
            return Ok(match self.resolve_locked(guard, id, &response).await? {
                Resumption::Resumed(report) => Some(report),
                _ => None,
            });
        }

        let origin = Origin::new(id.as_str(), record.workflow.clone(), entry.node.as_str());
        match &entry.default {
            Some(default) => {
                info!(instance = %id, node = %entry.node, "Deadline elapsed, applying default");
                let candidate = CandidateEvent::new(entry.response_type.clone())
                    .with("request_id", entry.request_id.to_string())
                    .with("value", default.clone())
                    .with("synthesized", true)
                    .with_origin(&origin);
                match self.gate.submit(candidate).await? {
                    Admission::Admitted { event, .. } => Ok(match self.resolve_locked(guard, id, &event).await? {
                        Resumption::Resumed(report) => Some(report),
                        _ => None,
                    }),
                    Admission::Rejected { violation, .. } => {
                        let mut instance = self.rebuild(&record, None)?;
                        instance.apply(&violation)?;
                        self.drive(&mut instance).await?;
                        Ok(Some(self.park(guard, instance)))
                    }
                }
            }
            None => {
                info!(instance = %id, node = %entry.node, "Deadline elapsed without a response");
                let event = self
                    .log
                    .append(
                        CandidateEvent::new(EventType::well_known(well_known::WORKFLOW_TIMED_OUT))
                            .with("request_id", entry.request_id.to_string())
                            .with("deadline_ms", entry.deadline_ms)
                            .with_origin(&origin),
                    )
                    .await?;
                let mut instance = self.rebuild(&record, None)?;
                instance.apply(&event)?;
                self.suspensions.remove(id).await?;
                Ok(Some(self.park(guard, instance)))
            }
        }
    }

    /// Pick suspended instances back up after a restart.
    ///
    /// Instances whose response already reached the log resume; those with
    /// nothing pending are driven on; due deadlines fire. The rest are
    /// loaded as suspended.
    pub async fn recover(&self) -> SchedulerResult<Vec<InstanceReport>> {
        let records = self.suspensions.list().await?;
        info!(suspended = records.len(), "Recovering suspended instances");
        let mut recovered = Vec::new();

        for record in records {
            let id = record.instance.clone();
            let (slot, mut guard) = self.lock(&id).await;
            let report = self.recover_locked(&mut guard, record).await;
            self.release(&id, &slot, guard);
            recovered.extend(report?);
        }

        recovered.extend(self.fire_timers().await?);
        Ok(recovered)
    }

    async fn recover_locked(
        &self,
        guard: &mut SlotGuard,
        record: SuspensionRecord,
    ) -> SchedulerResult<Option<InstanceReport>> {
        let snapshot = self.log.snapshot();
        let answered = record
            .pending()
            .find_map(|entry| logged_response(&snapshot, entry));

        if let Some(response) = answered {
            return Ok(match self.resolve_locked(guard, &record.instance, &response).await? {
                Resumption::Resumed(report) => Some(report),
                _ => None,
            });
        }

        let mut instance = self.rebuild(&record, None)?;
        if record.is_pending() {
            instance.transition(InstanceState::Suspended)?;
        } else {
            self.drive(&mut instance).await?;
        }
        Ok(Some(self.park(guard, instance)))
    }
}

/// First response in the log after `entry`'s request that answers it.
fn logged_response(snapshot: &Context, entry: &AwaitedResponse) -> Option<Event> {
    let start = snapshot.position(&entry.request_id)?;
    let request_id = entry.request_id.to_string();
    snapshot.events()[start + 1..]
        .iter()
        .find(|e| e.event_type == entry.response_type && e.get_str("request_id") == Some(request_id.as_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::NodeStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use weft_gate::{Limit, OnViolation, Policy, Rule};
    use weft_invoker::{HandlerRegistry, InvocationError, InvokerConfig, StepRef};
    use weft_suspension::{InMemorySuspensionStore, SuspensionResult};
    use weft_types::{TypePattern, ValuePath};
    use weft_workflow::{Condition, Node, Trigger};

    async fn scheduler(registry: HandlerRegistry) -> Scheduler {
        scheduler_with(
            registry,
            Arc::new(InMemorySuspensionStore::new()),
            SchedulerConfig::default(),
        )
        .await
    }

    async fn scheduler_with(
        registry: HandlerRegistry,
        suspensions: Arc<dyn SuspensionStore>,
        config: SchedulerConfig,
    ) -> Scheduler {
        let log = Arc::new(EventLog::in_memory().await.unwrap());
        let gate = Arc::new(PolicyGate::new(log));
        let invoker = Arc::new(StepInvoker::new(Arc::new(registry), InvokerConfig::default()));
        Scheduler::new(gate, invoker, suspensions, config)
    }

    /// Holds every save back, so responses can land while an instance suspends.
    struct SlowSaves {
        inner: InMemorySuspensionStore,
        delay: Duration,
    }

    #[async_trait]
    impl SuspensionStore for SlowSaves {
        async fn save(&self, record: SuspensionRecord) -> SuspensionResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.save(record).await
        }

        async fn load(&self, instance: &InstanceId) -> SuspensionResult<SuspensionRecord> {
            self.inner.load(instance).await
        }

        async fn resolve(&self, instance: &InstanceId, response: &Event) -> SuspensionResult<Resolution> {
            self.inner.resolve(instance, response).await
        }

        async fn remove(&self, instance: &InstanceId) -> SuspensionResult<bool> {
            self.inner.remove(instance).await
        }

        async fn list(&self) -> SuspensionResult<Vec<SuspensionRecord>> {
            self.inner.list().await
        }
    }

    fn approval() -> WorkflowDefinition {
        WorkflowDefinition::new("h", when())
            .node(Node::human("ask", json!("approve ${trigger.topic}?"), None, None))
            .node(Node::returns("out", json!("${ask.value}")).needs(["ask"]))
    }

    fn counted(registry: &HandlerRegistry, tool: &'static str) -> Arc<AtomicU32> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        registry.register_tool(tool, move |_ctx, _input| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![CandidateEvent::parse("tool.response").unwrap()])
            }
        });
        calls
    }

    fn echo(registry: &HandlerRegistry, tool: &'static str) {
        registry.register_tool(tool, move |_ctx, input| async move {
            Ok(vec![CandidateEvent::parse("tool.response")
                .unwrap()
                .with("result", format!("{tool} done"))
                .with("input", input)])
        });
    }

    fn query() -> CandidateEvent {
        CandidateEvent::parse("user.query").unwrap().with("topic", "x")
    }

    fn when() -> Trigger {
        Trigger::on(TypePattern::parse("user.query").unwrap())
    }

    fn started(outcome: TriggerOutcome) -> InstanceReport {
        match outcome {
            TriggerOutcome::Started { mut instances, .. } => instances.remove(0),
            TriggerOutcome::Rejected { .. } => panic!("trigger rejected"),
        }
    }

    fn types(log: &EventLog) -> Vec<String> {
        log.snapshot().iter().map(|e| e.event_type.to_string()).collect()
    }

    #[tokio::test]
    async fn sequential_workflow_completes_with_output() {
        let registry = HandlerRegistry::new();
        echo(&registry, "fetch");
        let scheduler = scheduler(registry).await;
        scheduler
            .register(
                WorkflowDefinition::new("seq", when())
                    .node(Node::tool("fetch", "fetch", json!({"q": "${trigger.topic}"})))
                    .node(Node::returns("out", json!("${fetch.result}")).needs(["fetch"])),
            )
            .await
            .unwrap();

        let report = started(scheduler.trigger(query()).await.unwrap());
        assert_eq!(report.state, InstanceState::Completed);
        assert_eq!(report.output, Some(json!("fetch done")));
        assert_eq!(types(scheduler.log()), vec!["user.query", "tool.response"]);

        let response = scheduler.log().snapshot().get(1).cloned().unwrap();
        assert_eq!(response.data["input"], json!({"q": "x"}));
        assert_eq!(response.data["tool"], json!("fetch"));
        assert_eq!(response.origin().unwrap().node, "fetch");
    }

    #[tokio::test]
    async fn invalid_definition_is_recorded_and_refused() {
        let scheduler = scheduler(HandlerRegistry::new()).await;
        let err = scheduler
            .register(WorkflowDefinition::new("bad", when()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Workflow(_)));
        assert_eq!(types(scheduler.log()), vec!["workflow.invariant_violation"]);
        assert!(scheduler.workflow("bad").is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_is_an_error() {
        let scheduler = scheduler(HandlerRegistry::new()).await;
        let def = WorkflowDefinition::new("w", when()).node(Node::returns("r", json!(1)));
        scheduler.register(def.clone()).await.unwrap();
        assert!(matches!(
            scheduler.register(def).await,
            Err(SchedulerError::DuplicateWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn step_failure_is_logged_and_fails_the_instance() {
        let registry = HandlerRegistry::new();
        registry.register_tool("flaky", |_ctx, _input| async {
            Err(InvocationError::permanent("backend down"))
        });
        let scheduler = scheduler(registry).await;
        scheduler
            .register(WorkflowDefinition::new("f", when()).node(Node::tool("call", "flaky", json!({}))))
            .await
            .unwrap();

        let report = started(scheduler.trigger(query()).await.unwrap());
        assert_eq!(report.state, InstanceState::Failed);
        let snapshot = scheduler.log().snapshot();
        let error = snapshot.last().unwrap();
        assert_eq!(error.event_type.as_str(), well_known::TOOL_ERROR);
        assert_eq!(error.data["attempts"], json!(1));
        assert_eq!(error.data["timed_out"], json!(false));
    }

    #[tokio::test]
    async fn denied_tool_is_never_invoked_and_fallback_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = HandlerRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register_tool("shell", move |_ctx, _input| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![CandidateEvent::parse("tool.response").unwrap()])
            }
        });
        echo(&registry, "safe");

        let scheduler = scheduler(registry).await;
        scheduler
            .gate()
            .add_policy(
                Policy::new("guard")
                    .deny(Rule::tool("shell"))
                    .on_violation(OnViolation::Fallback),
            )
            .unwrap();
        scheduler
            .register(
                WorkflowDefinition::new("fb", when())
                    .node(Node::tool("run", "shell", json!({})).with_fallback("recover"))
                    .node(Node::tool("recover", "safe", json!({})).needs(["run"])),
            )
            .await
            .unwrap();

        let report = started(scheduler.trigger(query()).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.state, InstanceState::Completed);
        assert_eq!(report.nodes["run"], NodeStatus::Diverted);
        assert_eq!(report.nodes["recover"], NodeStatus::Done);
        assert!(!types(scheduler.log()).iter().any(|t| t == "tool.request"));
    }

    #[tokio::test]
    async fn branch_without_match_fails_with_invariant_violation() {
        let scheduler = scheduler(HandlerRegistry::new()).await;
        scheduler
            .register(
                WorkflowDefinition::new("b", when())
                    .node(Node::branch(
                        "route",
                        ValuePath::parse("trigger.topic").unwrap(),
                        vec![(json!("other"), "end")],
                        None,
                    ))
                    .node(Node::returns("end", json!(null)).needs(["route"])),
            )
            .await
            .unwrap();

        let report = started(scheduler.trigger(query()).await.unwrap());
        assert_eq!(report.state, InstanceState::Failed);
        assert_eq!(
            types(scheduler.log()).last().map(String::as_str),
            Some(well_known::WORKFLOW_INVARIANT_VIOLATION)
        );
    }

    #[tokio::test]
    async fn loop_passes_previous_output_to_next_iteration() {
        let registry = HandlerRegistry::new();
        registry.register_agent("counter", |_ctx, input| async move {
            let n = input["n"].as_u64().unwrap_or(0);
            Ok(vec![CandidateEvent::parse("agent.response").unwrap().with("n", n + 1)])
        });
        let scheduler = scheduler(registry).await;
        scheduler
            .register(WorkflowDefinition::new("l", when()).node(Node::looped(
                "count",
                StepRef::agent("counter"),
                json!({"n": "${prev.n}"}),
                10,
                Some(Condition::equals(ValuePath::parse("prev.n").unwrap(), 4)),
            )))
            .await
            .unwrap();

        let report = started(scheduler.trigger(query()).await.unwrap());
        assert_eq!(report.state, InstanceState::Completed);
        assert_eq!(report.bindings["count"]["data"]["n"], json!(4));
        assert_eq!(scheduler.log().version(), 5);
    }

    #[tokio::test]
    async fn respond_resumes_and_second_response_is_a_no_op() {
        let scheduler = scheduler(HandlerRegistry::new()).await;
        scheduler
            .register(
                WorkflowDefinition::new("h", when())
                    .node(Node::human("ask", json!("approve ${trigger.topic}?"), None, None))
                    .node(Node::returns("out", json!("${ask.value}")).needs(["ask"])),
            )
            .await
            .unwrap();

        let report = started(scheduler.trigger(query()).await.unwrap());
        assert_eq!(report.state, InstanceState::Suspended);
        let request_id = report.awaiting[0].request_id;

        let resumed = scheduler.respond(&report.id, request_id, json!("yes")).await.unwrap();
        let Resumption::Resumed(done) = resumed else {
            panic!("expected resumption");
        };
        assert_eq!(done.state, InstanceState::Completed);
        assert_eq!(done.output, Some(json!("yes")));
        let version = scheduler.log().version();

        let again = scheduler.respond(&report.id, request_id, json!("no")).await.unwrap();
        assert!(matches!(again, Resumption::NotSuspended));
        assert_eq!(scheduler.log().version(), version);
    }

    #[tokio::test]
    async fn external_response_resolves_once() {
        let scheduler = scheduler(HandlerRegistry::new()).await;
        scheduler
            .register(
                WorkflowDefinition::new("h", when())
                    .node(Node::human("ask", json!("?"), None, None))
                    .node(Node::human("ask_again", json!("??"), None, None).needs(["ask"])),
            )
            .await
            .unwrap();
        let report = started(scheduler.trigger(query()).await.unwrap());
        let request_id = report.awaiting[0].request_id;

        let Admission::Admitted { event: response, .. } = scheduler
            .gate()
            .submit(
                CandidateEvent::parse("hil.response")
                    .unwrap()
                    .with("request_id", request_id.to_string())
                    .with("value", "ok"),
            )
            .await
            .unwrap()
        else {
            panic!("expected admission");
        };

        let first = scheduler.handle_response(&response).await.unwrap();
        let Some(Resumption::Resumed(report)) = first else {
            panic!("expected resumption");
        };
        assert_eq!(report.state, InstanceState::Suspended);
        assert_eq!(report.nodes["ask"], NodeStatus::Done);
        let version = scheduler.log().version();

        let second = scheduler.resolve(&report.id, &response).await.unwrap();
        assert!(matches!(second, Resumption::AlreadyResolved));
        assert_eq!(scheduler.log().version(), version);
    }

    #[tokio::test]
    async fn replay_of_the_log_matches_the_live_instance() {
        let registry = HandlerRegistry::new();
        echo(&registry, "a");
        echo(&registry, "b");
        let scheduler = scheduler(registry).await;
        scheduler
            .register(
                WorkflowDefinition::new("r", when())
                    .node(Node::parallel("both", ["a", "b"]))
                    .node(Node::tool("a", "a", json!({})))
                    .node(Node::tool("b", "b", json!({})))
                    .node(Node::returns("out", json!("${both}")).needs(["both"])),
            )
            .await
            .unwrap();

        let TriggerOutcome::Started { trigger, instances } = scheduler.trigger(query()).await.unwrap() else {
            panic!("expected start");
        };
        let live = &instances[0];
        let mut replayed = scheduler
            .replay("r", live.id.clone(), &trigger.id, &scheduler.log().snapshot())
            .unwrap();
        // Joins and returns are derived, not logged.
        assert!(replayed.advance().unwrap().is_empty());
        assert_eq!(replayed.state(), InstanceState::Completed);
        assert_eq!(replayed.output(), live.output.as_ref());
        assert_eq!(replayed.bindings().to_values(), live.bindings);
    }

    #[tokio::test]
    async fn response_logged_while_suspending_is_not_lost() {
        let store = Arc::new(SlowSaves {
            inner: InMemorySuspensionStore::new(),
            delay: Duration::from_millis(200),
        });
        let scheduler = scheduler_with(HandlerRegistry::new(), store, SchedulerConfig::default()).await;
        scheduler.register(approval()).await.unwrap();

        let responder = async {
            let request = loop {
                let logged = scheduler
                    .log()
                    .snapshot()
                    .iter()
                    .find(|e| e.event_type.as_str() == well_known::HIL_REQUEST)
                    .cloned();
                match logged {
                    Some(request) => break request,
                    None => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            };
            let Admission::Admitted { event: response, .. } = scheduler
                .gate()
                .submit(
                    CandidateEvent::parse("hil.response")
                        .unwrap()
                        .with("request_id", request.id.to_string())
                        .with("value", "ok"),
                )
                .await
                .unwrap()
            else {
                panic!("expected admission");
            };
            scheduler.handle_response(&response).await.unwrap()
        };

        let (outcome, handled) = tokio::join!(scheduler.trigger(query()), responder);
        let report = started(outcome.unwrap());
        assert_eq!(report.state, InstanceState::Completed);
        assert_eq!(report.output, Some(json!("ok")));
        // The instance had already picked the response up by the time the
        // handler got its lock.
        assert!(matches!(handled, Some(Resumption::NotSuspended)));
        assert!(scheduler.suspensions().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_instances_leave_the_instance_table() {
        let scheduler = scheduler(HandlerRegistry::new()).await;
        scheduler.register(approval()).await.unwrap();

        let report = started(scheduler.trigger(query()).await.unwrap());
        assert_eq!(scheduler.instance_ids(), vec![report.id.clone()]);
        let request_id = report.awaiting[0].request_id;

        let resumed = scheduler.respond(&report.id, request_id, json!("yes")).await.unwrap();
        assert!(matches!(resumed, Resumption::Resumed(_)));
        assert!(scheduler.instance_ids().is_empty());
        let kept = scheduler.instance(&report.id).await.unwrap();
        assert_eq!(kept.state, InstanceState::Completed);
        assert_eq!(kept.output, Some(json!("yes")));

        let stranger = InstanceId::new("nobody");
        let answer = scheduler.respond(&stranger, request_id, json!("no")).await.unwrap();
        assert!(matches!(answer, Resumption::NotSuspended));
        assert!(scheduler.instance_ids().is_empty());
        assert!(scheduler.instance(&stranger).await.is_none());
    }

    #[tokio::test]
    async fn finished_reports_are_bounded() {
        let config = SchedulerConfig {
            finished_capacity: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler_with(
            HandlerRegistry::new(),
            Arc::new(InMemorySuspensionStore::new()),
            config,
        )
        .await;
        scheduler
            .register(WorkflowDefinition::new("r", when()).node(Node::returns("out", json!(1))))
            .await
            .unwrap();

        let first = started(scheduler.trigger(query()).await.unwrap());
        let second = started(scheduler.trigger(query()).await.unwrap());
        assert!(scheduler.instance(&first.id).await.is_none());
        assert_eq!(
            scheduler.instance(&second.id).await.map(|r| r.state),
            Some(InstanceState::Completed)
        );
    }

    #[tokio::test]
    async fn request_limit_stops_the_second_tool_call() {
        let registry = HandlerRegistry::new();
        let first_calls = counted(&registry, "first");
        let second_calls = counted(&registry, "second");
        let scheduler = scheduler(registry).await;
        scheduler
            .gate()
            .add_policy(Policy::new("budget").limit(Limit::count(
                "one-call",
                TypePattern::parse("tool.request").unwrap(),
                1,
            )))
            .unwrap();
        scheduler
            .register(
                WorkflowDefinition::new("two", when())
                    .node(Node::tool("a", "first", json!({})))
                    .node(Node::tool("b", "second", json!({})).needs(["a"])),
            )
            .await
            .unwrap();

        let report = started(scheduler.trigger(query()).await.unwrap());
        assert_eq!(report.state, InstanceState::Failed);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);

        let snapshot = scheduler.log().snapshot();
        let preflights = snapshot
            .iter()
            .filter(|e| e.event_type.as_str() == well_known::POLICY_CHECKED)
            .filter(|e| e.get_str("phase") == Some("preflight"))
            .count();
        assert_eq!(preflights, 1);
        let violation = snapshot.last().unwrap();
        assert_eq!(violation.event_type.as_str(), well_known::POLICY_VIOLATION);
        assert_eq!(violation.origin().unwrap().node, "b");
    }

    #[tokio::test]
    async fn instance_scoped_budgets_are_dropped_when_the_instance_finishes() {
        let registry = HandlerRegistry::new();
        echo(&registry, "fetch");
        let scheduler = scheduler(registry).await;
        scheduler
            .gate()
            .add_policy(
                Policy::new("budget").limit(
                    Limit::count("per-run", TypePattern::parse("tool.request").unwrap(), 5).per_instance(),
                ),
            )
            .unwrap();
        scheduler
            .register(WorkflowDefinition::new("one", when()).node(Node::tool("fetch", "fetch", json!({}))))
            .await
            .unwrap();

        for _ in 0..3 {
            let report = started(scheduler.trigger(query()).await.unwrap());
            assert_eq!(report.state, InstanceState::Completed);
        }
        assert_eq!(scheduler.gate().cached_views(), 0);
        assert!(scheduler.instance_ids().is_empty());
    }
}
