//! Structured audit trail of workflow lifecycle events.
//!
//! [`JsonlAuditWriter`] files each event under the day it occurred and
//! plugs into the [`crate::events::EventBus`] as an ordinary subscriber;
//! [`attach`] wires it up from configuration.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GlobalConfig;
use crate::events::{EventBus, EventType, SubscriptionId, WorkflowEvent};

/// A structured record of one workflow event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// When the event happened; selects the day file.
    pub occurred_at: DateTime<Utc>,
    /// When the entry was built.
    pub recorded_at: DateTime<Utc>,
    /// Session the event belongs to.
    pub session_id: String,
    /// Event classification.
    pub event_type: EventType,
    /// One-line human readable description.
    pub summary: String,
    /// Full event payload.
    pub event: WorkflowEvent,
}

impl AuditEntry {
    /// Build an entry describing `event`.
    #[must_use]
    pub fn from_event(event: &WorkflowEvent) -> Self {
        Self {
            occurred_at: event.timestamp(),
            recorded_at: Utc::now(),
            session_id: event.session_id().to_owned(),
            event_type: event.event_type(),
            summary: summarize(event),
            event: event.clone(),
        }
    }
}

fn summarize(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::SessionStarted { case_id, .. } => format!("session started for case {case_id}"),
        WorkflowEvent::TaskCompleted { task_id, phase, .. } => {
            format!("task {task_id} completed in {phase}")
        }
        WorkflowEvent::TaskFailed { task_id, error, .. } => format!("task {task_id} failed: {error}"),
        WorkflowEvent::TaskRequeued {
            task_id,
            reason,
            retry_count,
            ..
        } => format!("task {task_id} requeued after {retry_count} failures: {reason}"),
        WorkflowEvent::PhaseTransitioned { from, to, .. } => format!("phase {from} -> {to}"),
        WorkflowEvent::ReviewRequested {
            request_id, phase, ..
        } => format!("review {request_id} requested for {phase}"),
        WorkflowEvent::ReviewResolved {
            request_id,
            approved,
            ..
        } => {
            let verdict = if *approved { "approved" } else { "rejected" };
            format!("review {request_id} {verdict}")
        }
        WorkflowEvent::SessionStalled { phase, reason, .. } => {
            format!("session stalled in {phase}: {reason}")
        }
        WorkflowEvent::SessionCompleted { .. } => "session completed".to_owned(),
        WorkflowEvent::SessionFailed { reason, .. } => format!("session failed: {reason}"),
        WorkflowEvent::SessionAborted { .. } => "session aborted".to_owned(),
    }
}

/// Writes structured audit entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait AuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

pub use writer::JsonlAuditWriter;

/// Subscribe a [`JsonlAuditWriter`] to every event on `bus` when
/// `audit_log_dir` is configured.
///
/// # Errors
///
/// Returns `AppError::Io` if the audit directory cannot be created.
pub fn attach(bus: &EventBus, config: &GlobalConfig) -> crate::Result<Option<SubscriptionId>> {
    let Some(dir) = config.audit_log_dir.clone() else {
        return Ok(None);
    };
    tracing::info!(dir = %dir.display(), "audit log attached");
    let writer = JsonlAuditWriter::new(dir)?;
    Ok(Some(bus.subscribe_all(writer)))
}
