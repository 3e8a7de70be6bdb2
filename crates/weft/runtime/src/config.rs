use std::path::Path;

use serde::{Deserialize, Serialize};
use weft_gate::GateConfig;
use weft_invoker::InvokerConfig;
use weft_log::LogConfig;
use weft_scheduler::SchedulerConfig;
use weft_suspension::SuspensionConfig;
use weft_workflow::WorkflowDefinition;

use crate::error::{RuntimeError, RuntimeResult};

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete runtime configuration, usually read from a TOML file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub log: LogConfig,
    pub gate: GateConfig,
    pub invoker: InvokerConfig,
    pub scheduler: SchedulerConfig,
    pub suspension: SuspensionConfig,
    pub logging: LoggingConfig,
    /// Workflows registered when the runtime opens.
    pub workflows: Vec<WorkflowDefinition>,
}

impl RuntimeConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> RuntimeResult<Self> {
        toml::from_str(contents).map_err(|e| RuntimeError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_gate::OnViolation;

    #[test]
    fn missing_file_gives_defaults() {
        let config = RuntimeConfig::load("/nonexistent/weft/config.toml").unwrap();
        assert!(config.log.data_dir.is_none());
        assert!(config.suspension.dir.is_none());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.scheduler.timer_interval_ms, 1_000);
        assert_eq!(config.scheduler.finished_capacity, 1_024);
    }

    #[test]
    fn toml_configures_every_layer() {
        let config = RuntimeConfig::from_toml(
            r#"
            [log]
            data_dir = "/var/lib/weft/log"

            [invoker]
            max_concurrency = 4

            [scheduler]
            timer_interval_ms = 250
            finished_capacity = 16

            [suspension]
            dir = "/var/lib/weft/suspended"

            [logging]
            level = "debug"
            json = true

            [[gate.policies]]
            name = "guard"
            on_violation = "fallback"
            deny = [{ name = "no-shell", selector = { kind = "tool", name = "shell" } }]

            [[workflows]]
            name = "echo"
            when = { pattern = "user.query" }

            [[workflows.nodes]]
            id = "out"
            kind = "return"
            value = "${trigger.topic}"
            "#,
        )
        .unwrap();

        assert_eq!(config.invoker.max_concurrency, 4);
        assert_eq!(config.invoker.default_timeout_ms, Some(30_000));
        assert_eq!(config.scheduler.timer_interval_ms, 250);
        assert_eq!(config.scheduler.finished_capacity, 16);
        assert!(config.logging.json);
        assert_eq!(config.gate.policies[0].on_violation, OnViolation::Fallback);
        assert_eq!(config.workflows[0].nodes.len(), 1);
        assert!(config.workflows[0].validate().is_ok());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            RuntimeConfig::from_toml("[log"),
            Err(RuntimeError::Config(_))
        ));
    }
}
