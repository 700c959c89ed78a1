//! JSONL audit log writer, one file per event day.
//!
//! Entries are filed under the date the event occurred, not the date they
//! were written, so a replayed or late event still lands in its own day.
//! Every line carries its 1-based position in that day's file; the count
//! picks up where an earlier process left off.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use super::{AuditEntry, AuditLogger};
use crate::events::{EventHandler, WorkflowEvent};
use crate::{AppError, Result};

/// The day file currently open for appends.
struct DayFile {
    date: NaiveDate,
    out: BufWriter<File>,
    lines: u64,
}

#[derive(Serialize)]
struct Line<'a> {
    line: u64,
    #[serde(flatten)]
    entry: &'a AuditEntry,
}

/// Appends one JSON object per line to `<log_dir>/audit-YYYY-MM-DD.jsonl`.
pub struct JsonlAuditWriter {
    log_dir: PathBuf,
    current: Mutex<Option<DayFile>>,
}

impl JsonlAuditWriter {
    /// Writer storing day files in `log_dir`, created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|err| {
            AppError::Io(format!(
                "cannot create audit directory {}: {err}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            current: Mutex::new(None),
        })
    }

    /// Day file holding events that occurred on `date`.
    #[must_use]
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        day_path(&self.log_dir, date)
    }
}

fn day_path(log_dir: &Path, date: NaiveDate) -> PathBuf {
    log_dir.join(format!("audit-{date}.jsonl"))
}

fn open_day(log_dir: &Path, date: NaiveDate) -> Result<DayFile> {
    let path = day_path(log_dir, date);
    let io_err =
        |err: std::io::Error| AppError::Io(format!("audit log {}: {err}", path.display()));

    let lines = match File::open(&path) {
        Ok(existing) => {
            let mut count = 0u64;
            for line in BufReader::new(existing).lines() {
                line.map_err(io_err)?;
                count += 1;
            }
            count
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => return Err(io_err(err)),
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(io_err)?;
    debug!(path = %path.display(), lines, "audit day file opened");
    Ok(DayFile {
        date,
        out: BufWriter::new(file),
        lines,
    })
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let date = entry.occurred_at.date_naive();
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        if current.as_ref().is_none_or(|day| day.date != date) {
            *current = Some(open_day(&self.log_dir, date)?);
        }
        let Some(day) = current.as_mut() else {
            return Err(AppError::Internal("audit day file missing".into()));
        };

        let record = serde_json::to_string(&Line {
            line: day.lines + 1,
            entry: &entry,
        })?;
        let written = writeln!(day.out, "{record}").and_then(|()| day.out.flush());
        if let Err(err) = written {
            warn!(%err, session_id = %entry.session_id, "audit write failed");
            // Reopen on the next entry so the line count is re-read from disk.
            *current = None;
            return Err(AppError::Io(format!("audit write failed: {err}")));
        }
        day.lines += 1;
        Ok(())
    }
}

impl EventHandler for JsonlAuditWriter {
    fn handle(&self, event: &WorkflowEvent) -> Result<()> {
        self.log_entry(AuditEntry::from_event(event))
    }
}
