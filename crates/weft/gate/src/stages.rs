use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_projector::{project, Projector, View, ViewSpec};
use weft_types::{well_known, CandidateEvent, Context, Event, EventType};

use crate::policy::{Constraint, Limit, LimitScope, Measure, Policy, Rule, Selector};

/// Why a candidate was rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub policy: String,
    pub rule: String,
    pub reason: String,
    /// The value that triggered the rule.
    pub value: Value,
}

/// Result of a single stage.
#[derive(Clone, Debug, PartialEq)]
pub enum StageResult {
    Pass,
    Reject(Rejection),
}

impl StageResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, StageResult::Pass)
    }
}

/// The resources a candidate touches, read from its data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subject {
    pub tool: Option<String>,
    pub capabilities: Vec<String>,
}

impl Subject {
    pub fn of(candidate: &CandidateEvent) -> Self {
        let tool = candidate.get_str("tool").map(str::to_string);
        let capabilities = match candidate.get("capability") {
            Some(Value::String(c)) => vec![c.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        Self { tool, capabilities }
    }
}

/// Everything a stage may look at. Stages are pure functions of this input.
pub struct CheckInput<'a> {
    pub policy: &'a Policy,
    pub candidate: &'a CandidateEvent,
    pub context: &'a Context,
    pub subject: Subject,
    /// Optional incremental projector for limit folds.
    pub projector: Option<&'a Projector>,
}

impl CheckInput<'_> {
    fn reject(&self, rule: &str, reason: String, value: Value) -> StageResult {
        StageResult::Reject(Rejection {
            policy: self.policy.name.clone(),
            rule: rule.to_string(),
            reason,
            value,
        })
    }

    fn project(&self, spec: &ViewSpec) -> View {
        match self.projector {
            Some(projector) => projector.project(self.context, spec),
            None => project(self.context, spec),
        }
    }
}

/// A single step of the fixed check pipeline.
pub trait CheckStage: Send + Sync {
    fn stage_name(&self) -> &'static str;
    fn stage_number(&self) -> u8;
    fn evaluate(&self, input: &CheckInput<'_>) -> StageResult;
}

/// The value a selector matched on the candidate, if any.
fn selector_hit(selector: &Selector, input: &CheckInput<'_>) -> Option<Value> {
    match selector {
        Selector::Tool { name } => input
            .subject
            .tool
            .as_ref()
            .filter(|tool| name == "*" || *tool == name)
            .map(|tool| Value::String(tool.clone())),
        Selector::Capability { name } => input
            .subject
            .capabilities
            .iter()
            .find(|c| *c == name)
            .map(|c| Value::String(c.clone())),
        Selector::EventType { pattern } => pattern
            .matches(&input.candidate.event_type)
            .then(|| Value::String(input.candidate.event_type.to_string())),
        Selector::Field { field, equals } => input
            .candidate
            .field(field)
            .filter(|v| *v == equals)
            .cloned(),
    }
}

// ── Stage 1 ──────────────────────────────────────────────────────────

/// Any matching deny rule rejects. Runs first so deny wins over allow.
pub struct DenyStage;

impl CheckStage for DenyStage {
    fn stage_name(&self) -> &'static str {
        "deny"
    }

    fn stage_number(&self) -> u8 {
        1
    }

    fn evaluate(&self, input: &CheckInput<'_>) -> StageResult {
        for rule in &input.policy.deny {
            if let Some(value) = selector_hit(&rule.selector, input) {
                return input.reject(&rule.name, format!("denied by rule '{}'", rule.name), value);
            }
        }
        StageResult::Pass
    }
}

// ── Stage 2 ──────────────────────────────────────────────────────────

/// When a policy lists allow rules of a kind and the candidate has a subject
/// of that kind, the subject must be covered by one of them.
pub struct AllowStage;

impl AllowStage {
    fn rules<'p>(policy: &'p Policy, kind: fn(&Selector) -> bool) -> Vec<&'p Rule> {
        policy.allow.iter().filter(|r| kind(&r.selector)).collect()
    }
}

impl CheckStage for AllowStage {
    fn stage_name(&self) -> &'static str {
        "allow"
    }

    fn stage_number(&self) -> u8 {
        2
    }

    fn evaluate(&self, input: &CheckInput<'_>) -> StageResult {
        let policy = input.policy;

        let tool_rules = Self::rules(policy, |s| matches!(s, Selector::Tool { .. }));
        if let Some(tool) = &input.subject.tool {
            if !tool_rules.is_empty()
                && !tool_rules
                    .iter()
                    .any(|r| selector_hit(&r.selector, input).is_some())
            {
                return input.reject(
                    "allow:tool",
                    format!("tool '{tool}' is not in the allow list"),
                    Value::String(tool.clone()),
                );
            }
        }

        let capability_rules = Self::rules(policy, |s| matches!(s, Selector::Capability { .. }));
        if !capability_rules.is_empty() {
            let missing = input.subject.capabilities.iter().find(|c| {
                !capability_rules
                    .iter()
                    .any(|r| matches!(&r.selector, Selector::Capability { name } if name == *c))
            });
            if let Some(capability) = missing {
                return input.reject(
                    "allow:capability",
                    format!("capability '{capability}' is not in the allow list"),
                    Value::String(capability.clone()),
                );
            }
        }

        let type_rules = Self::rules(policy, |s| matches!(s, Selector::EventType { .. }));
        if !type_rules.is_empty()
            && !type_rules
                .iter()
                .any(|r| selector_hit(&r.selector, input).is_some())
        {
            return input.reject(
                "allow:event_type",
                format!("event type '{}' is not allowed", input.candidate.event_type),
                Value::String(input.candidate.event_type.to_string()),
            );
        }

        let field_rules = Self::rules(policy, |s| matches!(s, Selector::Field { .. }));
        for rule in &field_rules {
            let Selector::Field { field, .. } = &rule.selector else {
                continue;
            };
            let Some(actual) = input.candidate.field(field) else {
                continue;
            };
            let covered = field_rules.iter().any(|r| {
                matches!(&r.selector, Selector::Field { field: f, equals } if f == field && equals == actual)
            });
            if !covered {
                return input.reject(
                    &format!("allow:field:{field}"),
                    format!("value of '{field}' is not in the allow list"),
                    actual.clone(),
                );
            }
        }

        StageResult::Pass
    }
}

// ── Stage 3 ──────────────────────────────────────────────────────────

/// Per-tool input constraints.
pub struct ValidationStage;

impl ValidationStage {
    fn input_value<'c>(candidate: &'c CandidateEvent, field: &str) -> Option<&'c Value> {
        candidate
            .field(&format!("input.{field}"))
            .or_else(|| candidate.field(field))
    }
}

impl CheckStage for ValidationStage {
    fn stage_name(&self) -> &'static str {
        "validation"
    }

    fn stage_number(&self) -> u8 {
        3
    }

    fn evaluate(&self, input: &CheckInput<'_>) -> StageResult {
        let Some(tool) = &input.subject.tool else {
            return StageResult::Pass;
        };

        for validation in &input.policy.validations {
            if validation.tool != "*" && validation.tool != *tool {
                continue;
            }
            let Some(value) = Self::input_value(input.candidate, &validation.field) else {
                continue;
            };
            let rule = format!("validation:{}.{}", tool, validation.field);

            match &validation.constraint {
                Constraint::MaxLength { max } => {
                    let len = match value {
                        Value::String(s) => s.chars().count(),
                        Value::Array(items) => items.len(),
                        _ => 0,
                    };
                    if len > *max {
                        return input.reject(
                            &rule,
                            format!("'{}' is {len} long, max {max}", validation.field),
                            value.clone(),
                        );
                    }
                }
                Constraint::Pattern { regex } => {
                    let matched = match (regex::Regex::new(regex), value.as_str()) {
                        (Ok(re), Some(s)) => re.is_match(s),
                        // Fail closed on an unusable pattern or a non-string value.
                        _ => false,
                    };
                    if !matched {
                        return input.reject(
                            &rule,
                            format!("'{}' does not match /{regex}/", validation.field),
                            value.clone(),
                        );
                    }
                }
                Constraint::DenyList { terms } => {
                    let haystack = match value {
                        Value::String(s) => s.to_lowercase(),
                        other => other.to_string().to_lowercase(),
                    };
                    if let Some(term) = terms
                        .iter()
                        .find(|t| !t.is_empty() && haystack.contains(&t.to_lowercase()))
                    {
                        return input.reject(
                            &rule,
                            format!("'{}' contains denied term '{term}'", validation.field),
                            value.clone(),
                        );
                    }
                }
            }
        }
        StageResult::Pass
    }
}

// ── Stage 4 ──────────────────────────────────────────────────────────

/// Budgets folded from the context. A breach rejects; nothing is clamped.
///
/// Requests are preflighted and never appended, so a cleared preflight
/// leaves a `policy.checked` marker (phase [`PREFLIGHT_PHASE`]) carrying the
/// request under `request`. Limits count such a marker as the request it
/// stands for.
pub struct LimitStage;

/// `phase` of the `policy.checked` marker a cleared preflight leaves.
pub const PREFLIGHT_PHASE: &str = "preflight";

/// The type an event counts as for limits, and where its measured fields live.
fn tallied_as(event: &Event) -> Option<(EventType, &'static str)> {
    if event.event_type.as_str() == well_known::POLICY_CHECKED
        && event.get_str("phase") == Some(PREFLIGHT_PHASE)
    {
        let stands_for = EventType::parse(event.get_str("event_type")?).ok()?;
        return Some((stands_for, "request."));
    }
    Some((event.event_type.clone(), ""))
}

impl LimitStage {
    fn contribution(measure: &Measure, candidate: &CandidateEvent) -> f64 {
        match measure {
            Measure::Count => 1.0,
            Measure::Sum { field } => candidate.field(field).and_then(Value::as_f64).unwrap_or(0.0),
        }
    }

    fn view(policy: &Policy, limit: &Limit, owner: Option<String>) -> ViewSpec {
        let name = match &owner {
            Some(instance) => format!("limit:{}:{}:{instance}", policy.name, limit.name),
            None => format!("limit:{}:{}", policy.name, limit.name),
        };
        let pattern = limit.pattern.clone();
        let measure = limit.measure.clone();
        ViewSpec::tally(name, move |event| {
            let (event_type, prefix) = tallied_as(event)?;
            if !pattern.matches(&event_type) {
                return None;
            }
            if let Some(owner) = &owner {
                if !event.origin().is_some_and(|o| o.instance == *owner) {
                    return None;
                }
            }
            match &measure {
                Measure::Count => Some(1.0),
                Measure::Sum { field } => event.field(&format!("{prefix}{field}")).and_then(Value::as_f64),
            }
        })
    }
}

impl CheckStage for LimitStage {
    fn stage_name(&self) -> &'static str {
        "limits"
    }

    fn stage_number(&self) -> u8 {
        4
    }

    fn evaluate(&self, input: &CheckInput<'_>) -> StageResult {
        let instance = input.candidate.origin().map(|o| o.instance);

        for limit in &input.policy.limits {
            if !limit.pattern.matches(&input.candidate.event_type) {
                continue;
            }

            let owner = match limit.scope {
                LimitScope::Instance => instance.clone(),
                LimitScope::Log => None,
            };
            let prior = input.project(&Self::view(input.policy, limit, owner)).amount();

            let total = prior + Self::contribution(&limit.measure, input.candidate);
            if total > limit.max {
                return input.reject(
                    &format!("limit:{}", limit.name),
                    format!(
                        "limit '{}' exceeded: {total} > {}",
                        limit.name, limit.max
                    ),
                    serde_json::json!(total),
                );
            }
        }
        StageResult::Pass
    }
}

/// Drop cached limit folds scoped to `instance`.
pub fn forget_instance(projector: &Projector, policies: &[Policy], instance: &str) {
    for policy in policies {
        for limit in policy.limits.iter().filter(|l| l.scope == LimitScope::Instance) {
            projector.forget(&LimitStage::view(policy, limit, Some(instance.to_string())));
        }
    }
}

/// The fixed, fail-closed stage order.
pub fn pipeline() -> [&'static dyn CheckStage; 4] {
    [&DenyStage, &AllowStage, &ValidationStage, &LimitStage]
}
