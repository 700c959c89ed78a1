//! Workflow session model and lifecycle helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::{Phase, PhaseStatus};
use super::review::ReviewRequest;
use super::task::{Task, TaskStatus};
use crate::{AppError, Result};

/// Lifecycle status for a workflow session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, first phase not planned yet.
    Pending,
    /// Coordinator is (or may be) dispatching tasks.
    Running,
    /// Suspended on a human decision.
    AwaitingReview,
    /// Terminal phase finished.
    Completed,
    /// Halted by a failed task, rejected review or internal fault.
    Failed,
    /// Stopped by an operator.
    Aborted,
}

impl SessionStatus {
    /// Whether the session can never run again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Aborted
        )
    }
}

/// Global context shared across tasks; keys are kept in sorted order.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// One document-production run, owned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowSession {
    /// Unique session identifier.
    pub id: String,
    /// Case this run produces documents for.
    pub case_id: String,
    /// Phase the pipeline currently sits in.
    pub current_phase: Phase,
    /// Overall lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Status of every phase.
    pub phases: BTreeMap<Phase, PhaseStatus>,
    /// Free-form data shared across tasks.
    pub context: Context,
    /// Task arena indexed by task id.
    pub tasks: BTreeMap<String, Task>,
    /// Ids of completed tasks, in completion order.
    pub completed_tasks: Vec<String>,
    /// Ids of failed tasks, in failure order.
    pub failed_tasks: Vec<String>,
    /// Ids of review requests awaiting a decision.
    pub pending_approvals: Vec<String>,
    /// Review requests raised for this session.
    pub reviews: BTreeMap<String, ReviewRequest>,
    /// Sequence number of the latest checkpoint.
    pub checkpoint_seq: u64,
    /// Diagnostic recorded when the session failed.
    pub failure: Option<String>,
}

impl WorkflowSession {
    /// Construct a new pending session with a generated identifier.
    #[must_use]
    pub fn new(case_id: String, context: Context) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            case_id,
            current_phase: Phase::first(),
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            phases: Phase::ALL
                .into_iter()
                .map(|phase| (phase, PhaseStatus::Pending))
                .collect(),
            context,
            tasks: BTreeMap::new(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            pending_approvals: Vec::new(),
            reviews: BTreeMap::new(),
            checkpoint_seq: 0,
            failure: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (SessionStatus::Pending, SessionStatus::Running | SessionStatus::Failed)
                | (
                    SessionStatus::Running,
                    SessionStatus::AwaitingReview | SessionStatus::Completed | SessionStatus::Failed
                )
                | (
                    SessionStatus::AwaitingReview,
                    SessionStatus::Running | SessionStatus::Failed
                )
                | (
                    SessionStatus::Pending | SessionStatus::Running | SessionStatus::AwaitingReview,
                    SessionStatus::Aborted
                )
        )
    }

    /// Move to `next`, enforcing the session state machine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the transition is not permitted.
    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "session {} cannot move from {:?} to {next:?}",
                self.id, self.status
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Record the status of a phase.
    pub fn set_phase_status(&mut self, phase: Phase, status: PhaseStatus) {
        self.phases.insert(phase, status);
        self.touch();
    }

    /// Status of a phase; phases never touched are pending.
    #[must_use]
    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        self.phases
            .get(&phase)
            .copied()
            .unwrap_or(PhaseStatus::Pending)
    }

    /// Look up a task by id.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Iterate the tasks belonging to `phase`, ordered by id.
    pub fn tasks_in_phase(&self, phase: Phase) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(move |task| task.phase == phase)
    }

    /// Insert a validated task plan and derive `unblocks` back-edges.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Plan` if a task id is already present.
    pub fn insert_plan(&mut self, plan: Vec<Task>) -> Result<()> {
        for task in &plan {
            if self.tasks.contains_key(&task.id) {
                return Err(AppError::Plan(format!("duplicate task id: {}", task.id)));
            }
        }

        let edges: Vec<(String, String)> = plan
            .iter()
            .flat_map(|task| {
                task.prerequisites
                    .iter()
                    .map(|prereq| (prereq.clone(), task.id.clone()))
            })
            .collect();

        for task in plan {
            self.tasks.insert(task.id.clone(), task);
        }

        for (prereq, dependent) in edges {
            if let Some(upstream) = self.tasks.get_mut(&prereq) {
                if !upstream.unblocks.contains(&dependent) {
                    upstream.unblocks.push(dependent);
                }
            }
        }

        self.touch();
        Ok(())
    }

    /// Change a task's status, enforcing the task state machine.
    ///
    /// Completion is refused while any prerequisite is incomplete. The
    /// completed/failed id lists are kept in step with the arena.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task or
    /// `AppError::InvalidTransition` if the change is not permitted.
    pub fn set_task_status(&mut self, task_id: &str, next: TaskStatus) -> Result<()> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;

        if !task.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "task {task_id} cannot move from {:?} to {next:?}",
                task.status
            )));
        }

        if next == TaskStatus::Completed {
            let incomplete = task.prerequisites.iter().find(|prereq| {
                self.tasks
                    .get(prereq.as_str())
                    .is_none_or(|upstream| upstream.status != TaskStatus::Completed)
            });
            if let Some(prereq) = incomplete {
                return Err(AppError::InvalidTransition(format!(
                    "task {task_id} cannot complete before prerequisite {prereq}"
                )));
            }
        }

        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = next;
        }
        match next {
            TaskStatus::Completed => self.completed_tasks.push(task_id.to_owned()),
            TaskStatus::Failed => self.failed_tasks.push(task_id.to_owned()),
            _ => {}
        }
        self.touch();
        Ok(())
    }

    /// Merge context updates, last writer wins on key collision.
    pub fn merge_context(&mut self, updates: Context) {
        for (key, value) in updates {
            self.context.insert(key, value);
        }
        self.touch();
    }

    /// Refresh the last-update timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
