//! Review request model for the human-approval gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::Phase;

/// Resolution state of a review request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResolution {
    /// Awaiting a reviewer decision.
    Pending,
    /// Reviewer accepted the content.
    Approved,
    /// Reviewer rejected the content.
    Rejected,
}

/// A pending human-approval gate for a phase or a set of task outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ReviewRequest {
    /// Unique record identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Phase under review.
    pub phase: Phase,
    /// Snapshot of the content the reviewer decides on.
    pub content: serde_json::Value,
    /// Tasks whose outputs are under review; empty for a phase-completion review.
    pub task_ids: Vec<String>,
    /// Creation timestamp.
    pub requested_at: DateTime<Utc>,
    /// Current resolution.
    pub resolution: ReviewResolution,
    /// Reviewer feedback text.
    pub feedback: Option<String>,
    /// When the decision was recorded.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewRequest {
    /// Construct a new pending review request.
    #[must_use]
    pub fn new(
        session_id: String,
        phase: Phase,
        content: serde_json::Value,
        task_ids: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            phase,
            content,
            task_ids,
            requested_at: Utc::now(),
            resolution: ReviewResolution::Pending,
            feedback: None,
            resolved_at: None,
        }
    }

    /// Whether the request still awaits a decision.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.resolution == ReviewResolution::Pending
    }

    /// Whether this request gates phase completion rather than task outputs.
    #[must_use]
    pub fn is_phase_review(&self) -> bool {
        self.task_ids.is_empty()
    }
}
