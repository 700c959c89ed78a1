//! Retention service for time-based checkpoint purge.
//!
//! Runs as a background task deleting superseded checkpoints older than
//! `retention_days`. The latest checkpoint of every session survives so
//! any session can still be inspected or resumed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::db::Database;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass and return the number of deleted checkpoints.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge(db: &Database, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let cutoff_str = cutoff.to_rfc3339();

    let result = sqlx::query(
        "DELETE FROM checkpoint
         WHERE created_at < ?1
           AND sequence < (SELECT MAX(latest.sequence) FROM checkpoint AS latest
                           WHERE latest.session_id = checkpoint.session_id)",
    )
    .bind(&cutoff_str)
    .execute(db)
    .await?;

    let deleted = result.rows_affected();
    info!(retention_days, deleted, "retention purge completed");
    Ok(deleted)
}
