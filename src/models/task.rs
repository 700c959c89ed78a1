//! Task model: a unit of work assigned to one agent capability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::Phase;

/// Scheduling priority; higher priorities dispatch first within a phase.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Always first.
    Critical,
}

/// Lifecycle status for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for prerequisites or a dispatch slot.
    Pending,
    /// Handed to an agent in the current batch.
    InProgress,
    /// Output accepted.
    Completed,
    /// Retry budget exhausted or output rejected; terminal.
    Failed,
    /// Output produced, waiting on a human decision.
    AwaitingReview,
    /// Session aborted before the task finished; terminal.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition can leave this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Default retry ceiling for tasks built without an explicit value.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// A unit of work within a phase, stored in the session's task arena.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Identifier unique within the session.
    pub id: String,
    /// Owning phase.
    pub phase: Phase,
    /// Target agent capability name.
    pub capability: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Input payload handed to the agent.
    pub input: serde_json::Value,
    /// Output payload, populated on completion.
    pub output: Option<serde_json::Value>,
    /// Prerequisite task ids, in declaration order.
    pub prerequisites: Vec<String>,
    /// Ids of tasks listing this one as a prerequisite.
    pub unblocks: Vec<String>,
    /// Agent instance that last ran the task (diagnostics only).
    pub assigned_agent: Option<String>,
    /// When the latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the latest attempt finished.
    pub ended_at: Option<DateTime<Utc>>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Failed attempts tolerated before the task fails for good.
    pub max_retries: u32,
    /// Description of the most recent failure.
    pub last_error: Option<String>,
    /// Whether the output must be approved by a human.
    pub requires_approval: bool,
    /// Human decision on the output, once made.
    pub approval: Option<bool>,
}

impl Task {
    /// Construct a pending task with normal priority and no edges.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        phase: Phase,
        capability: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            phase,
            capability: capability.into(),
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            input,
            output: None,
            prerequisites: Vec::new(),
            unblocks: Vec::new(),
            assigned_agent: None,
            started_at: None,
            ended_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            requires_approval: false,
            approval: None,
        }
    }

    /// Set the scheduling priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Append prerequisite task ids.
    #[must_use]
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Set the retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Require human approval of the output before completion.
    #[must_use]
    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `InProgress -> Pending` is the requeue path for retries and
    /// unavailable agents.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self.status, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (
                    TaskStatus::InProgress,
                    TaskStatus::Completed
                        | TaskStatus::Failed
                        | TaskStatus::AwaitingReview
                        | TaskStatus::Pending
                )
                | (
                    TaskStatus::AwaitingReview,
                    TaskStatus::Completed | TaskStatus::Failed
                )
                | (
                    TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::AwaitingReview,
                    TaskStatus::Cancelled
                )
        )
    }
}
