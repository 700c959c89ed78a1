//! Pipeline phases and their per-session status.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// A named stage in the fixed document-production pipeline.
///
/// Variant order is the pipeline order; `Ord` follows it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Collect case facts and source documents.
    Intake,
    /// Produce the document outline.
    Outline,
    /// Legal and factual research.
    Research,
    /// Write the first full draft.
    Drafting,
    /// Internal review of the draft.
    Review,
    /// Apply review feedback and polish.
    Editing,
    /// Produce the final deliverable.
    Finalization,
}

impl Phase {
    /// Every phase in pipeline order.
    pub const ALL: [Phase; 7] = [
        Phase::Intake,
        Phase::Outline,
        Phase::Research,
        Phase::Drafting,
        Phase::Review,
        Phase::Editing,
        Phase::Finalization,
    ];

    /// First phase of every session.
    #[must_use]
    pub const fn first() -> Self {
        Phase::Intake
    }

    /// Zero-based position of the phase in the pipeline.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Successor in the fixed sequence, or `None` at the terminal phase.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Canonical `snake_case` name, matching the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Outline => "outline",
            Phase::Research => "research",
            Phase::Drafting => "drafting",
            Phase::Review => "review",
            Phase::Editing => "editing",
            Phase::Finalization => "finalization",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| AppError::Config(format!("unknown phase: {s}")))
    }
}

/// Progress of a single phase within a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not reached yet.
    Pending,
    /// Task plan generated, tasks executing.
    Running,
    /// All work done, waiting on a human decision.
    AwaitingReview,
    /// Phase finished and the pipeline moved past it.
    Completed,
    /// Phase cannot complete (failed task or rejected review).
    Failed,
}
