//! `SQLite` schema bootstrap logic.
//!
//! Table definitions use `CREATE TABLE IF NOT EXISTS`, so bootstrapping is
//! safe on every connect.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the checkpoint schema to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS checkpoint (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    sequence        INTEGER NOT NULL CHECK(sequence >= 0),
    reason          TEXT NOT NULL,
    phase           TEXT NOT NULL CHECK(phase IN ('intake','outline','research','drafting','review','editing','finalization')),
    session_state   TEXT NOT NULL,
    digest          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE(session_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_checkpoint_session ON checkpoint(session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
