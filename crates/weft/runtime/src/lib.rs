//! Weft runtime.
//!
//! Assembles the event log, policy gate, step invoker, suspension store and
//! scheduler from one [`RuntimeConfig`], and runs the background work that
//! keeps suspended instances moving: a log listener that routes external
//! human responses and a timer loop that fires elapsed deadlines.
//!
//! ```toml
//! [log]
//! data_dir = "/var/lib/weft/log"
//!
//! [suspension]
//! dir = "/var/lib/weft/suspended"
//!
//! [[gate.policies]]
//! name = "guard"
//! deny = [{ name = "no-shell", selector = { kind = "tool", name = "shell" } }]
//! ```

pub mod config;
pub mod error;
pub mod telemetry;

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use weft_gate::{Policy, PolicyGate};
use weft_invoker::{StepBackend, StepInvoker};
use weft_log::{EventLog, HybridClock, IntegrityReport};
use weft_scheduler::{InstanceReport, Resumption, Scheduler, TriggerOutcome};
use weft_types::{CandidateEvent, EventId, TypePattern};
use weft_workflow::{InstanceId, WorkflowDefinition};

pub use config::{LoggingConfig, RuntimeConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use telemetry::init_tracing;

/// Summary of an audit export.
#[derive(Clone, Debug, Serialize)]
pub struct AuditSummary {
    pub exported_at: DateTime<Utc>,
    /// Number of events written; equal to the log version at export time.
    pub events: u64,
    pub integrity: IntegrityReport,
}

/// A running weft system.
pub struct Runtime {
    config: RuntimeConfig,
    log: Arc<EventLog>,
    gate: Arc<PolicyGate>,
    scheduler: Arc<Scheduler>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Open every component described by `config` against the system clock.
    pub async fn open(config: RuntimeConfig, backend: Arc<dyn StepBackend>) -> RuntimeResult<Self> {
        Self::open_with_clock(config, backend, HybridClock::system()).await
    }

    pub async fn open_with_clock(
        config: RuntimeConfig,
        backend: Arc<dyn StepBackend>,
        clock: HybridClock,
    ) -> RuntimeResult<Self> {
        let log = Arc::new(EventLog::open_with_clock(config.log.clone(), clock).await?);
        let gate = Arc::new(PolicyGate::with_config(Arc::clone(&log), config.gate.clone())?);
        let invoker = Arc::new(StepInvoker::new(backend, config.invoker.clone()));
        let suspensions = config.suspension.open()?;
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&gate),
            invoker,
            suspensions,
            config.scheduler.clone(),
        ));
        for workflow in &config.workflows {
            scheduler.register(workflow.clone()).await?;
        }

        info!(
            version = log.version(),
            policies = gate.policies().len(),
            workflows = config.workflows.len(),
            durable_log = config.log.data_dir.is_some(),
            durable_suspensions = config.suspension.dir.is_some(),
            "Runtime opened"
        );

        Ok(Self {
            config,
            log,
            gate,
            scheduler,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn gate(&self) -> &Arc<PolicyGate> {
        &self.gate
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> RuntimeResult<()> {
        Ok(self.scheduler.register(definition).await?)
    }

    pub fn add_policy(&self, policy: Policy) -> RuntimeResult<()> {
        Ok(self.gate.add_policy(policy)?)
    }

    /// Submit an initiating event. See [`Scheduler::trigger`].
    pub async fn trigger(&self, candidate: CandidateEvent) -> RuntimeResult<TriggerOutcome> {
        Ok(self.scheduler.trigger(candidate).await?)
    }

    /// Answer a pending human request.
    pub async fn respond(
        &self,
        instance: &InstanceId,
        request_id: EventId,
        value: Value,
    ) -> RuntimeResult<Resumption> {
        Ok(self.scheduler.respond(instance, request_id, value).await?)
    }

    pub async fn instance(&self, id: &InstanceId) -> Option<InstanceReport> {
        self.scheduler.instance(id).await
    }

    pub async fn fire_timers(&self) -> RuntimeResult<Vec<InstanceReport>> {
        Ok(self.scheduler.fire_timers().await?)
    }

    /// Resume what a previous process left suspended.
    pub async fn recover(&self) -> RuntimeResult<Vec<InstanceReport>> {
        Ok(self.scheduler.recover().await?)
    }

    /// Start the log listener and the timer loop.
    ///
    /// The listener forwards responses that carry a `request_id` but no
    /// `_origin`, i.e. those appended by outside callers; responses the
    /// scheduler produces itself are already applied.
    pub async fn spawn_background(&self) {
        let (subscription, mut events) = self.log.subscribe(TypePattern::Any).await;
        let scheduler = Arc::clone(&self.scheduler);
        let listener = tokio::spawn(async move {
            debug!(subscription = ?subscription.0, "Response listener started");
            while let Some(event) = events.recv().await {
                if event.get("request_id").is_none() || event.origin().is_some() {
                    continue;
                }
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    match scheduler.handle_response(&event).await {
                        Ok(Some(outcome)) => debug!(response = %event.id, ?outcome, "Response handled"),
                        Ok(None) => debug!(response = %event.id, "No suspended instance awaits response"),
                        Err(err) => error!(response = %event.id, error = %err, "Failed to handle response"),
                    }
                });
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        let period = Duration::from_millis(self.config.scheduler.timer_interval_ms.max(1));
        let timers = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match scheduler.fire_timers().await {
                    Ok(fired) if !fired.is_empty() => info!(fired = fired.len(), "Deadlines fired"),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "Timer sweep failed"),
                }
            }
        });

        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([listener, timers]);
        info!(timer_interval_ms = period.as_millis() as u64, "Background tasks started");
    }

    /// Stop background tasks and flush the log.
    pub async fn shutdown(&self) -> RuntimeResult<u64> {
        let handles: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        let version = self.log.checkpoint().await?;
        info!(version, "Runtime shut down");
        Ok(version)
    }

    /// Write the full log as JSON lines after verifying its integrity.
    pub fn export_audit<W: Write>(&self, writer: W) -> RuntimeResult<AuditSummary> {
        let integrity = self.log.verify()?;
        let events = self.log.export_jsonl(writer)?;
        let summary = AuditSummary {
            exported_at: Utc::now(),
            events,
            integrity,
        };
        info!(
            events = summary.events,
            clean = summary.integrity.is_clean(),
            "Audit log exported"
        );
        Ok(summary)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for handle in self
            .background
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}
