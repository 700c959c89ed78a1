//! Task plan generation for a phase.

use std::sync::Arc;

use serde_json::Value;

use crate::config::GlobalConfig;
use crate::models::phase::Phase;
use crate::models::session::WorkflowSession;
use crate::models::task::Task;
use crate::Result;

/// Produces the task plan for a phase when the session enters it.
///
/// Plans are validated by the coordinator before they reach the task
/// arena, so implementations only have to describe the work.
pub trait TaskPlanner: Send + Sync {
    /// Generate the tasks of `phase`.
    ///
    /// # Errors
    ///
    /// Implementations return `AppError::Plan` when no plan can be built.
    fn plan(&self, phase: Phase, session: &WorkflowSession) -> Result<Vec<Task>>;
}

impl<F> TaskPlanner for F
where
    F: Fn(Phase, &WorkflowSession) -> Result<Vec<Task>> + Send + Sync,
{
    fn plan(&self, phase: Phase, session: &WorkflowSession) -> Result<Vec<Task>> {
        self(phase, session)
    }
}

/// Builds plans from the `[[phases.<name>.tasks]]` templates of a config.
///
/// Phases without templates get an empty plan and complete immediately.
#[derive(Debug, Clone)]
pub struct ConfiguredPlanner {
    config: Arc<GlobalConfig>,
}

impl ConfiguredPlanner {
    /// Create a planner over `config`.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self { config }
    }
}

impl TaskPlanner for ConfiguredPlanner {
    fn plan(&self, phase: Phase, session: &WorkflowSession) -> Result<Vec<Task>> {
        let Some(phase_config) = self.config.phase(phase) else {
            return Ok(Vec::new());
        };

        phase_config
            .tasks
            .iter()
            .map(|template| {
                let mut input = match &template.input {
                    Some(raw) => serde_json::to_value(raw)?,
                    None => Value::Object(serde_json::Map::new()),
                };
                if let Value::Object(fields) = &mut input {
                    fields
                        .entry("case_id")
                        .or_insert_with(|| Value::String(session.case_id.clone()));
                }

                let mut task = Task::new(&template.id, phase, &template.capability, input)
                    .with_priority(template.priority)
                    .depends_on(&template.depends_on)
                    .with_max_retries(template.max_retries.unwrap_or(self.config.max_retries));
                if template.requires_approval {
                    task = task.requiring_approval();
                }
                Ok(task)
            })
            .collect()
    }
}
