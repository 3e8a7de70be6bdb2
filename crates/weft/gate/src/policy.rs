use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::TypePattern;

use crate::error::{GateError, GateResult};

/// What a rule applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selector {
    /// Candidates whose `data.tool` equals `name` (`*` matches any tool).
    Tool { name: String },
    /// Candidates declaring `name` in `data.capability`.
    Capability { name: String },
    EventType { pattern: TypePattern },
    /// Candidates whose data field (dotted path) equals `equals`.
    Field { field: String, equals: Value },
}

/// A named allow or deny rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub selector: Selector,
}

impl Rule {
    pub fn new(name: impl Into<String>, selector: Selector) -> Self {
        Self {
            name: name.into(),
            selector,
        }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(format!("tool:{name}"), Selector::Tool { name })
    }

    pub fn capability(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(format!("capability:{name}"), Selector::Capability { name })
    }

    pub fn event_type(pattern: TypePattern) -> Self {
        Self::new(format!("type:{pattern}"), Selector::EventType { pattern })
    }

    pub fn field(field: impl Into<String>, equals: impl Into<Value>) -> Self {
        let field = field.into();
        Self::new(
            format!("field:{field}"),
            Selector::Field {
                field,
                equals: equals.into(),
            },
        )
    }
}

/// How a limit measures prior activity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measure {
    Count,
    /// Sum of a numeric data field (dotted path), e.g. `usage.tokens` or `duration_ms`.
    Sum { field: String },
}

/// Which prior events a limit folds over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// Every matching event in the log.
    #[default]
    Log,
    /// Only events produced by the candidate's own workflow instance.
    Instance,
}

/// A budget: prior matching events plus the candidate must not exceed `max`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub name: String,
    pub pattern: TypePattern,
    pub measure: Measure,
    pub max: f64,
    #[serde(default)]
    pub scope: LimitScope,
}

impl Limit {
    pub fn count(name: impl Into<String>, pattern: TypePattern, max: u64) -> Self {
        Self {
            name: name.into(),
            pattern,
            measure: Measure::Count,
            max: max as f64,
            scope: LimitScope::Log,
        }
    }

    pub fn sum(name: impl Into<String>, pattern: TypePattern, field: impl Into<String>, max: f64) -> Self {
        Self {
            name: name.into(),
            pattern,
            measure: Measure::Sum {
                field: field.into(),
            },
            max,
            scope: LimitScope::Log,
        }
    }

    pub fn per_instance(mut self) -> Self {
        self.scope = LimitScope::Instance;
        self
    }
}

/// A per-tool input constraint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// Strings: at most `max` characters. Arrays: at most `max` items.
    MaxLength { max: usize },
    /// The value must be a string matching this regular expression.
    Pattern { regex: String },
    /// The value must not contain any listed term (case-insensitive).
    DenyList { terms: Vec<String> },
}

/// Validation of one input field of a tool, checked before the tool runs.
///
/// The value is read from `data.input.<field>`, falling back to `data.<field>`.
/// A missing value is not a violation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    /// Tool name, or `*` for every tool.
    pub tool: String,
    pub field: String,
    pub constraint: Constraint,
}

/// What the scheduler does with a step whose output a policy rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnViolation {
    /// The instance fails.
    #[default]
    Halt,
    /// The step's declared fallback node runs instead.
    Fallback,
}

/// A named set of allow/deny/validation/limit rules.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub name: String,
    pub allow: Vec<Rule>,
    pub deny: Vec<Rule>,
    pub limits: Vec<Limit>,
    pub validations: Vec<Validation>,
    pub on_violation: OnViolation,
}

impl Policy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn allow(mut self, rule: Rule) -> Self {
        self.allow.push(rule);
        self
    }

    pub fn deny(mut self, rule: Rule) -> Self {
        self.deny.push(rule);
        self
    }

    pub fn limit(mut self, limit: Limit) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn validate_input(
        mut self,
        tool: impl Into<String>,
        field: impl Into<String>,
        constraint: Constraint,
    ) -> Self {
        self.validations.push(Validation {
            tool: tool.into(),
            field: field.into(),
            constraint,
        });
        self
    }

    pub fn on_violation(mut self, on_violation: OnViolation) -> Self {
        self.on_violation = on_violation;
        self
    }

    /// Structural checks done once, when the policy is registered.
    pub fn validate(&self) -> GateResult<()> {
        let invalid = |reason: String| GateError::InvalidPolicy {
            policy: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("policy name is empty".into()));
        }
        for limit in &self.limits {
            if !limit.max.is_finite() || limit.max < 0.0 {
                return Err(invalid(format!("limit '{}' has invalid max", limit.name)));
            }
        }
        for validation in &self.validations {
            if let Constraint::Pattern { regex } = &validation.constraint {
                regex::Regex::new(regex).map_err(|e| {
                    invalid(format!(
                        "validation on '{}.{}': {e}",
                        validation.tool, validation.field
                    ))
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_deserializes_from_toml_shaped_json() {
        let raw = serde_json::json!({
            "name": "research",
            "deny": [{"name": "no-shell", "selector": {"kind": "tool", "name": "shell"}}],
            "limits": [{
                "name": "tool-budget",
                "pattern": "tool.*",
                "measure": {"kind": "count"},
                "max": 10.0,
                "scope": "instance"
            }],
            "validations": [{
                "tool": "web_search",
                "field": "query",
                "constraint": {"kind": "max_length", "max": 200}
            }],
            "on_violation": "fallback"
        });
        let policy: Policy = serde_json::from_value(raw).unwrap();
        assert_eq!(policy.deny[0].selector, Selector::Tool { name: "shell".into() });
        assert_eq!(policy.limits[0].scope, LimitScope::Instance);
        assert_eq!(policy.on_violation, OnViolation::Fallback);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn invalid_regex_is_rejected_at_registration() {
        let policy = Policy::new("p").validate_input(
            "*",
            "query",
            Constraint::Pattern {
                regex: "([unclosed".into(),
            },
        );
        assert!(matches!(policy.validate(), Err(GateError::InvalidPolicy { .. })));
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(Policy::default().validate().is_err());
    }
}
