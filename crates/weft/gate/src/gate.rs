use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use weft_log::EventLog;
use weft_projector::Projector;
use weft_types::{well_known, CandidateEvent, Event, EventType, ORIGIN_KEY};

use crate::check::check_all_with;
use crate::error::{GateError, GateResult};
use crate::policy::{OnViolation, Policy};
use crate::stages::{forget_instance, Rejection, PREFLIGHT_PHASE};

/// Configuration for the policy gate.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Policies registered at startup, in evaluation order.
    pub policies: Vec<Policy>,
}

/// Result of submitting a candidate for admission.
#[derive(Clone, Debug)]
pub enum Admission {
    /// The candidate is in the log. `checked` is the `policy.checked` event
    /// directly before it (absent when no policies are registered).
    Admitted { checked: Option<Event>, event: Event },
    /// The candidate was not appended; `violation` documents why.
    Rejected {
        violation: Event,
        rejection: Rejection,
        on_violation: OnViolation,
    },
}

impl Admission {
    pub fn event(&self) -> &Event {
        match self {
            Admission::Admitted { event, .. } => event,
            Admission::Rejected { violation, .. } => violation,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Result of checking a request before the work it asks for is done.
#[derive(Clone, Debug)]
pub enum Preflight {
    /// The request may proceed. `checked` is the marker that stands for it
    /// in the log (absent when no policies are registered).
    Clear { checked: Option<Event> },
    Rejected {
        violation: Event,
        rejection: Rejection,
        on_violation: OnViolation,
    },
}

/// The policy gate: nothing reaches the log through it unchecked.
///
/// Admissions are serialized by the gate so no other admission can land
/// between a check and the append it authorizes.
pub struct PolicyGate {
    log: Arc<EventLog>,
    policies: RwLock<Vec<Policy>>,
    admission: Mutex<()>,
    projector: Projector,
}

impl PolicyGate {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            log,
            policies: RwLock::new(Vec::new()),
            admission: Mutex::new(()),
            projector: Projector::new(),
        }
    }

    pub fn with_config(log: Arc<EventLog>, config: GateConfig) -> GateResult<Self> {
        let gate = Self::new(log);
        for policy in config.policies {
            gate.add_policy(policy)?;
        }
        Ok(gate)
    }

    /// Register a policy. Policies are evaluated in registration order.
    pub fn add_policy(&self, policy: Policy) -> GateResult<()> {
        policy.validate()?;
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        if policies.iter().any(|p| p.name == policy.name) {
            return Err(GateError::DuplicatePolicy(policy.name));
        }
        info!(
            policy = %policy.name,
            allow = policy.allow.len(),
            deny = policy.deny.len(),
            limits = policy.limits.len(),
            validations = policy.validations.len(),
            "Policy registered"
        );
        policies.push(policy);
        Ok(())
    }

    pub fn policies(&self) -> Vec<Policy> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Check a request (e.g. a `tool.request`) without appending it.
    ///
    /// On rejection a `policy.violation` is appended; the request never is.
    /// A cleared request leaves a `policy.checked` marker in preflight phase
    /// that carries the request data, so limits over request types see it.
    pub async fn preflight(&self, candidate: &CandidateEvent) -> GateResult<Preflight> {
        let policies = self.policies();
        if policies.is_empty() {
            return Ok(Preflight::Clear { checked: None });
        }

        let _admission = self.admission.lock().await;
        let context = self.log.snapshot();
        match check_all_with(&policies, candidate, &context, Some(&self.projector)) {
            Ok(()) => {
                let mut marker = Self::checked(&policies, candidate, context.version(), PREFLIGHT_PHASE)
                    .with("request", Value::Object(without_origin(candidate)));
                if let Some(origin) = candidate.get(ORIGIN_KEY) {
                    marker = marker.with(ORIGIN_KEY, origin.clone());
                }
                let checked = self.log.append(marker).await?;
                debug!(event_type = %candidate.event_type, marker = %checked.id, "Preflight clear");
                Ok(Preflight::Clear {
                    checked: Some(checked),
                })
            }
            Err((rejection, on_violation)) => {
                let violation = self
                    .record_violation(candidate, &rejection, on_violation, "preflight")
                    .await?;
                Ok(Preflight::Rejected {
                    violation,
                    rejection,
                    on_violation,
                })
            }
        }
    }

    /// Check a candidate against the freshest log and admit or reject it.
    ///
    /// Admit appends `policy.checked` and the candidate as one atomic group.
    /// Reject appends only `policy.violation`.
    pub async fn submit(&self, candidate: CandidateEvent) -> GateResult<Admission> {
        let policies = self.policies();
        let _admission = self.admission.lock().await;

        if policies.is_empty() {
            let event = self.log.append(candidate).await?;
            return Ok(Admission::Admitted {
                checked: None,
                event,
            });
        }

        let context = self.log.snapshot();
        match check_all_with(&policies, &candidate, &context, Some(&self.projector)) {
            Ok(()) => {
                let checked = Self::checked(&policies, &candidate, context.version(), "admission");
                let mut appended = self.log.append_all(vec![checked, candidate]).await?;
                let (Some(event), Some(checked)) = (appended.pop(), appended.pop()) else {
                    return Err(GateError::Log(weft_log::LogError::Backend(
                        "admission appended fewer events than submitted".into(),
                    )));
                };
                debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Candidate admitted"
                );
                Ok(Admission::Admitted {
                    checked: Some(checked),
                    event,
                })
            }
            Err((rejection, on_violation)) => {
                let violation = self
                    .record_violation(&candidate, &rejection, on_violation, "admission")
                    .await?;
                Ok(Admission::Rejected {
                    violation,
                    rejection,
                    on_violation,
                })
            }
        }
    }

    /// Drop cached budget folds scoped to a finished instance.
    pub fn forget_instance(&self, instance: &str) {
        forget_instance(&self.projector, &self.policies(), instance);
    }

    /// Number of budget folds currently cached.
    pub fn cached_views(&self) -> usize {
        self.projector.cached()
    }

    fn checked(policies: &[Policy], candidate: &CandidateEvent, version: u64, phase: &str) -> CandidateEvent {
        CandidateEvent::new(EventType::well_known(well_known::POLICY_CHECKED))
            .with(
                "policies",
                policies.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
            )
            .with("event_type", candidate.event_type.to_string())
            .with("phase", phase)
            .with("version", version)
    }

    async fn record_violation(
        &self,
        candidate: &CandidateEvent,
        rejection: &Rejection,
        on_violation: OnViolation,
        phase: &str,
    ) -> GateResult<Event> {
        warn!(
            policy = %rejection.policy,
            rule = %rejection.rule,
            event_type = %candidate.event_type,
            phase,
            reason = %rejection.reason,
            "Candidate rejected by policy"
        );

        let offending_data = without_origin(candidate);

        let mut violation = CandidateEvent::new(EventType::well_known(well_known::POLICY_VIOLATION))
            .with("policy", rejection.policy.clone())
            .with("rule", rejection.rule.clone())
            .with("reason", rejection.reason.clone())
            .with("value", rejection.value.clone())
            .with("offending_type", candidate.event_type.to_string())
            .with("offending_data", Value::Object(offending_data))
            .with("on_violation", json!(on_violation))
            .with("phase", phase);
        if let Some(origin) = candidate.get(ORIGIN_KEY) {
            violation = violation.with(ORIGIN_KEY, origin.clone());
        }

        Ok(self.log.append(violation).await?)
    }
}

fn without_origin(candidate: &CandidateEvent) -> serde_json::Map<String, Value> {
    candidate
        .data
        .iter()
        .filter(|(k, _)| k.as_str() != ORIGIN_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Limit, Rule};
    use weft_types::{Origin, TypePattern};

    async fn gate() -> PolicyGate {
        PolicyGate::new(Arc::new(EventLog::in_memory().await.unwrap()))
    }

    fn tool_response(tool: &str) -> CandidateEvent {
        CandidateEvent::parse("tool.response")
            .unwrap()
            .with("tool", tool)
            .with("result", "ok")
    }

    #[tokio::test]
    async fn transparent_without_policies() {
        let gate = gate().await;
        let admission = gate.submit(tool_response("web_search")).await.unwrap();
        assert!(matches!(admission, Admission::Admitted { checked: None, .. }));
        assert_eq!(gate.log().version(), 1);
    }

    #[tokio::test]
    async fn policy_checked_directly_precedes_admitted_event() {
        let gate = gate().await;
        gate.add_policy(Policy::new("p").allow(Rule::tool("web_search")))
            .unwrap();

        let Admission::Admitted { checked, event } =
            gate.submit(tool_response("web_search")).await.unwrap()
        else {
            panic!("expected admission");
        };

        let snapshot = gate.log().snapshot();
        assert_eq!(snapshot.version(), 2);
        let checked = checked.unwrap();
        assert_eq!(snapshot.get(0).unwrap().id, checked.id);
        assert_eq!(snapshot.get(1).unwrap().id, event.id);
        assert_eq!(checked.event_type.as_str(), well_known::POLICY_CHECKED);
        assert_eq!(checked.data["event_type"], json!("tool.response"));
    }

    #[tokio::test]
    async fn rejection_appends_violation_only() {
        let gate = gate().await;
        gate.add_policy(Policy::new("guard").deny(Rule::tool("shell")))
            .unwrap();

        let origin = Origin::new("i-1", "wf", "run");
        let admission = gate
            .submit(tool_response("shell").with_origin(&origin))
            .await
            .unwrap();
        let Admission::Rejected { violation, rejection, on_violation } = admission else {
            panic!("expected rejection");
        };

        assert_eq!(rejection.policy, "guard");
        assert_eq!(on_violation, OnViolation::Halt);
        assert_eq!(gate.log().version(), 1);
        assert_eq!(violation.event_type.as_str(), well_known::POLICY_VIOLATION);
        assert_eq!(violation.data["offending_type"], json!("tool.response"));
        assert_eq!(violation.data["offending_data"]["tool"], json!("shell"));
        assert_eq!(violation.origin(), Some(origin));
    }

    #[tokio::test]
    async fn preflight_never_appends_the_request() {
        let gate = gate().await;
        gate.add_policy(Policy::new("guard").deny(Rule::tool("shell")))
            .unwrap();

        let origin = Origin::new("i-1", "wf", "search");
        let ok = CandidateEvent::parse("tool.request")
            .unwrap()
            .with("tool", "web_search")
            .with_origin(&origin);
        let Preflight::Clear { checked: Some(marker) } = gate.preflight(&ok).await.unwrap() else {
            panic!("expected a cleared preflight");
        };
        assert_eq!(marker.event_type.as_str(), well_known::POLICY_CHECKED);
        assert_eq!(marker.data["phase"], json!("preflight"));
        assert_eq!(marker.data["event_type"], json!("tool.request"));
        assert_eq!(marker.data["request"], json!({"tool": "web_search"}));
        assert_eq!(marker.origin(), Some(origin));

        let denied = CandidateEvent::parse("tool.request").unwrap().with("tool", "shell");
        assert!(matches!(
            gate.preflight(&denied).await.unwrap(),
            Preflight::Rejected { .. }
        ));
        let types: Vec<String> = gate
            .log()
            .snapshot()
            .iter()
            .map(|e| e.event_type.to_string())
            .collect();
        assert_eq!(types, vec!["policy.checked", "policy.violation"]);
    }

    #[tokio::test]
    async fn request_limits_count_cleared_preflights() {
        let gate = gate().await;
        gate.add_policy(Policy::new("budget").limit(Limit::count(
            "one-call",
            TypePattern::parse("tool.request").unwrap(),
            1,
        )))
        .unwrap();

        let request = CandidateEvent::parse("tool.request").unwrap().with("tool", "web_search");
        assert!(matches!(
            gate.preflight(&request).await.unwrap(),
            Preflight::Clear { checked: Some(_) }
        ));
        let Preflight::Rejected { rejection, .. } = gate.preflight(&request).await.unwrap() else {
            panic!("second request should breach the limit");
        };
        assert_eq!(rejection.rule, "limit:one-call");
        assert_eq!(rejection.value, json!(2.0));
    }

    #[tokio::test]
    async fn request_sums_read_the_marker_payload() {
        let gate = gate().await;
        gate.add_policy(Policy::new("budget").limit(Limit::sum(
            "tokens",
            TypePattern::parse("agent.request").unwrap(),
            "input.tokens",
            100.0,
        )))
        .unwrap();

        let ask = |tokens: u64| {
            CandidateEvent::parse("agent.request")
                .unwrap()
                .with("agent", "writer")
                .with("input", json!({"tokens": tokens}))
        };
        assert!(matches!(gate.preflight(&ask(60)).await.unwrap(), Preflight::Clear { .. }));
        assert!(matches!(gate.preflight(&ask(40)).await.unwrap(), Preflight::Clear { .. }));
        assert!(matches!(gate.preflight(&ask(1)).await.unwrap(), Preflight::Rejected { .. }));
    }

    #[tokio::test]
    async fn admission_markers_are_not_counted_as_requests() {
        let gate = gate().await;
        gate.add_policy(Policy::new("budget").limit(Limit::count(
            "one-call",
            TypePattern::parse("tool.request").unwrap(),
            1,
        )))
        .unwrap();

        for tool in ["a", "b", "c"] {
            assert!(gate.submit(tool_response(tool)).await.unwrap().is_admitted());
        }
        let request = CandidateEvent::parse("tool.request").unwrap().with("tool", "a");
        assert!(matches!(gate.preflight(&request).await.unwrap(), Preflight::Clear { .. }));
    }

    #[tokio::test]
    async fn limits_are_folded_from_the_log() {
        let gate = gate().await;
        gate.add_policy(Policy::new("budget").limit(Limit::count(
            "two",
            TypePattern::parse("tool.response").unwrap(),
            2,
        )))
        .unwrap();

        assert!(gate.submit(tool_response("a")).await.unwrap().is_admitted());
        assert!(gate.submit(tool_response("b")).await.unwrap().is_admitted());
        assert!(!gate.submit(tool_response("c")).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn duplicate_policy_names_are_rejected() {
        let gate = gate().await;
        gate.add_policy(Policy::new("p")).unwrap();
        assert!(matches!(
            gate.add_policy(Policy::new("p")),
            Err(GateError::DuplicatePolicy(_))
        ));
    }
}
