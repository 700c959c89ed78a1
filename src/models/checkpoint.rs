//! Checkpoint model for session state snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::Phase;

/// An immutable snapshot of a session's serializable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Unique record identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Monotonic per-session sequence number; the highest one wins on restore.
    pub sequence: u64,
    /// Why the checkpoint was taken (e.g., "batch", "phase_transition").
    pub reason: String,
    /// Session phase at checkpoint time.
    pub phase: Phase,
    /// Serialized session state snapshot.
    pub session_state: serde_json::Value,
    /// SHA-256 hex digest of the serialized session state.
    pub digest: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Construct a new checkpoint snapshot.
    #[must_use]
    pub fn new(
        session_id: String,
        sequence: u64,
        reason: String,
        phase: Phase,
        session_state: serde_json::Value,
        digest: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            sequence,
            reason,
            phase,
            session_state,
            digest,
            created_at: Utc::now(),
        }
    }
}
