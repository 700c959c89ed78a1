//! Checkpoint repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::checkpoint::Checkpoint;
use crate::models::phase::Phase;
use crate::{AppError, Result};

use super::db::Database;
use super::store::{CheckpointStore, StoreFuture};

/// Repository wrapper around `SQLite` for checkpoint records.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: String,
    session_id: String,
    sequence: i64,
    reason: String,
    phase: String,
    session_state: String,
    digest: String,
    created_at: String,
}

impl CheckpointRow {
    /// Convert a database row into the domain model.
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let sequence = u64::try_from(self.sequence)
            .map_err(|e| AppError::Db(format!("invalid sequence: {e}")))?;
        let phase = self
            .phase
            .parse::<Phase>()
            .map_err(|e| AppError::Db(format!("invalid phase: {e}")))?;
        let session_state = serde_json::from_str(&self.session_state)
            .map_err(|e| AppError::Db(format!("invalid session_state: {e}")))?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Checkpoint {
            id: self.id,
            session_id: self.session_id,
            sequence,
            reason: self.reason,
            phase,
            session_state,
            digest: self.digest,
            created_at,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, session_id, sequence, reason, phase, session_state, digest, created_at \
     FROM checkpoint";

impl SqliteCheckpointStore {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new checkpoint record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, checkpoint: &Checkpoint) -> Result<()> {
        let sequence = i64::try_from(checkpoint.sequence)
            .map_err(|e| AppError::Db(format!("sequence out of range: {e}")))?;
        let session_state = serde_json::to_string(&checkpoint.session_state)
            .map_err(|e| AppError::Db(format!("serialize session_state: {e}")))?;
        let created_at = checkpoint.created_at.to_rfc3339();

        sqlx::query(
            "INSERT INTO checkpoint (id, session_id, sequence, reason, phase,
             session_state, digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.session_id)
        .bind(sequence)
        .bind(&checkpoint.reason)
        .bind(checkpoint.phase.as_str())
        .bind(&session_state)
        .bind(&checkpoint.digest)
        .bind(&created_at)
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Latest checkpoint for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is malformed.
    pub async fn latest_for_session(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let query = format!("{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY sequence DESC LIMIT 1");
        let row: Option<CheckpointRow> = sqlx::query_as(&query)
            .bind(session_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// List all checkpoints for a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is malformed.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let query = format!("{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY sequence ASC");
        let rows: Vec<CheckpointRow> = sqlx::query_as(&query)
            .bind(session_id)
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    /// Delete all checkpoints for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoint WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> StoreFuture<'a, ()> {
        Box::pin(self.create(checkpoint))
    }

    fn load<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<Checkpoint>> {
        Box::pin(self.latest_for_session(session_id))
    }

    fn history<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Vec<Checkpoint>> {
        Box::pin(self.list_for_session(session_id))
    }
}
