//! Checkpoint creation and restore for workflow session snapshots.
//!
//! [`CheckpointManager::snapshot`] serializes a session, digests the
//! serialized form with SHA-256 and hands it to the configured store.
//! [`CheckpointManager::restore`] verifies the digest before trusting a
//! snapshot.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, info_span, warn, Instrument};

use crate::models::checkpoint::Checkpoint;
use crate::models::session::WorkflowSession;
use crate::models::task::TaskStatus;
use crate::persistence::store::CheckpointStore;
use crate::{AppError, Result};

/// Snapshots sessions into a [`CheckpointStore`].
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Snapshot `session`, bumping its checkpoint sequence.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CheckpointIo` if serialization or the store fails.
    pub async fn snapshot(
        &self,
        session: &mut WorkflowSession,
        reason: &str,
    ) -> Result<Checkpoint> {
        let span = info_span!("snapshot", session_id = %session.id, reason);

        session.checkpoint_seq += 1;
        let session_state = serde_json::to_value(&*session).map_err(|err| {
            AppError::CheckpointIo(format!("failed to serialize session {}: {err}", session.id))
        })?;
        let digest = digest_state(&session_state)?;

        let checkpoint = Checkpoint::new(
            session.id.clone(),
            session.checkpoint_seq,
            reason.to_owned(),
            session.current_phase,
            session_state,
            digest,
        );

        self.store
            .save(&checkpoint)
            .instrument(span.clone())
            .await
            .map_err(|err| {
                AppError::CheckpointIo(format!(
                    "failed to save checkpoint {} for session {}: {err}",
                    checkpoint.sequence, checkpoint.session_id
                ))
            })?;

        span.in_scope(|| info!(sequence = checkpoint.sequence, "checkpoint saved"));
        Ok(checkpoint)
    }

    /// Rebuild a session from its latest checkpoint.
    ///
    /// Tasks that were in flight when the checkpoint was taken go back to
    /// pending so they are dispatched again.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoCheckpointFound` if the session never
    /// checkpointed, or `AppError::CheckpointIo` if the store fails, the
    /// digest does not match or the snapshot cannot be decoded.
    pub async fn restore(&self, session_id: &str) -> Result<WorkflowSession> {
        let checkpoint = self
            .store
            .load(session_id)
            .await
            .map_err(|err| {
                AppError::CheckpointIo(format!(
                    "failed to load checkpoint for session {session_id}: {err}"
                ))
            })?
            .ok_or_else(|| AppError::NoCheckpointFound(session_id.to_owned()))?;

        let span = info_span!("restore", session_id, sequence = checkpoint.sequence);
        let _guard = span.enter();

        verify(&checkpoint)?;

        let mut session: WorkflowSession = serde_json::from_value(checkpoint.session_state)
            .map_err(|err| {
                AppError::CheckpointIo(format!(
                    "checkpoint {} for session {session_id} cannot be decoded: {err}",
                    checkpoint.sequence
                ))
            })?;

        let mut requeued = 0usize;
        for task in session.tasks.values_mut() {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                requeued += 1;
            }
        }
        if requeued > 0 {
            warn!(requeued, "in-flight tasks returned to pending");
        }

        info!(status = ?session.status, phase = %session.current_phase, "session restored");
        Ok(session)
    }

    /// Every checkpoint of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CheckpointIo` if the store fails.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        self.store.history(session_id).await.map_err(|err| {
            AppError::CheckpointIo(format!(
                "failed to list checkpoints for session {session_id}: {err}"
            ))
        })
    }
}

/// Check a checkpoint's digest against its session state.
///
/// # Errors
///
/// Returns `AppError::CheckpointIo` on mismatch.
pub fn verify(checkpoint: &Checkpoint) -> Result<()> {
    let actual = digest_state(&checkpoint.session_state)?;
    if actual != checkpoint.digest {
        return Err(AppError::CheckpointIo(format!(
            "checkpoint {} for session {} failed digest verification",
            checkpoint.sequence, checkpoint.session_id
        )));
    }
    Ok(())
}

/// SHA-256 hex digest of the canonical JSON form of a session snapshot.
///
/// # Errors
///
/// Returns `AppError::CheckpointIo` if the state cannot be serialized.
pub fn digest_state(state: &serde_json::Value) -> Result<String> {
    let serialized = serde_json::to_string(state)
        .map_err(|err| AppError::CheckpointIo(format!("failed to serialize snapshot: {err}")))?;
    Ok(sha256_hex(serialized.as_bytes()))
}

/// Compute SHA-256 hex digest of the given bytes.
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
