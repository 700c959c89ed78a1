//! Global configuration parsing and validation.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::models::phase::Phase;
use crate::models::task::Priority;
use crate::{AppError, Result};

/// Per-capability worker pool settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Maximum simultaneous invocations of this capability.
    pub max_concurrency: usize,
}

/// Template for one task in a phase's generated plan.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TaskTemplate {
    /// Task id, unique across the whole pipeline.
    pub id: String,
    /// Agent capability that executes the task.
    pub capability: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Ids of prerequisite tasks in the same phase.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether the task output needs human approval.
    #[serde(default)]
    pub requires_approval: bool,
    /// Retry ceiling override; falls back to the global `max_retries`.
    pub max_retries: Option<u32>,
    /// Static input payload handed to the agent.
    #[serde(default)]
    pub input: Option<toml::Value>,
}

/// Per-phase behavior.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PhaseConfig {
    /// Whether phase advancement waits on human approval.
    #[serde(default)]
    pub requires_approval: bool,
    /// Task plan generated when the phase starts.
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_agent_concurrency() -> usize {
    1
}

/// Global configuration parsed from `docflow.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` checkpoint database path; `None` keeps checkpoints in memory.
    pub db_path: Option<PathBuf>,
    /// Days before superseded checkpoints are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Default retry ceiling for planned tasks.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Concurrency for capabilities without an `[agents.*]` entry.
    #[serde(default = "default_agent_concurrency")]
    pub default_agent_concurrency: usize,
    /// Directory for JSONL audit logs; `None` disables the audit subscriber.
    pub audit_log_dir: Option<PathBuf>,
    /// Worker pool settings keyed by capability name.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
    /// Phase settings keyed by phase name.
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            retention_days: default_retention_days(),
            max_retries: default_max_retries(),
            default_agent_concurrency: default_agent_concurrency(),
            audit_log_dir: None,
            agents: BTreeMap::new(),
            phases: BTreeMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Settings for `phase`, if configured.
    #[must_use]
    pub fn phase(&self, phase: Phase) -> Option<&PhaseConfig> {
        self.phases.get(phase.as_str())
    }

    /// Whether advancement past `phase` waits on human approval.
    #[must_use]
    pub fn requires_approval(&self, phase: Phase) -> bool {
        self.phase(phase).is_some_and(|cfg| cfg.requires_approval)
    }

    /// Concurrency limit for a capability.
    #[must_use]
    pub fn concurrency_for(&self, capability: &str) -> usize {
        self.agents
            .get(capability)
            .map_or(self.default_agent_concurrency, |agent| agent.max_concurrency)
    }

    fn validate(&self) -> Result<()> {
        if self.default_agent_concurrency == 0 {
            return Err(AppError::Config(
                "default_agent_concurrency must be greater than zero".into(),
            ));
        }

        for (name, agent) in &self.agents {
            if agent.max_concurrency == 0 {
                return Err(AppError::Config(format!(
                    "agents.{name}.max_concurrency must be greater than zero"
                )));
            }
        }

        let mut seen_ids = HashSet::new();
        for (name, phase) in &self.phases {
            name.parse::<Phase>()?;

            let local_ids: HashSet<&str> = phase.tasks.iter().map(|t| t.id.as_str()).collect();
            for task in &phase.tasks {
                if task.id.trim().is_empty() {
                    return Err(AppError::Config(format!(
                        "phases.{name} contains a task with an empty id"
                    )));
                }
                if !seen_ids.insert(task.id.clone()) {
                    return Err(AppError::Config(format!("duplicate task id: {}", task.id)));
                }
                if let Some(missing) = task
                    .depends_on
                    .iter()
                    .find(|dep| !local_ids.contains(dep.as_str()))
                {
                    return Err(AppError::Config(format!(
                        "task {} depends on {missing}, which is not planned in phase {name}",
                        task.id
                    )));
                }
            }
        }

        Ok(())
    }
}
