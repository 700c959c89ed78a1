//! Human review gate: raises, indexes and resolves review requests.
//!
//! Requests live on the owning [`WorkflowSession`] so they are checkpointed
//! with it; the gate only keeps a request id to session id index so a
//! reviewer's decision can be routed without knowing the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{info, info_span};

use crate::events::{EventBus, WorkflowEvent};
use crate::models::phase::Phase;
use crate::models::review::{ReviewRequest, ReviewResolution};
use crate::models::session::WorkflowSession;
use crate::{AppError, Result};

/// Routes review requests and decisions.
pub struct ReviewGate {
    index: Mutex<HashMap<String, String>>,
    events: Arc<EventBus>,
}

impl ReviewGate {
    /// Create a gate publishing to `events`.
    #[must_use]
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Raise a review request on `session`.
    ///
    /// An empty `task_ids` gates completion of `phase` itself.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if `phase` already has an
    /// outstanding request.
    pub fn request_review(
        &self,
        session: &mut WorkflowSession,
        phase: Phase,
        content: serde_json::Value,
        task_ids: Vec<String>,
    ) -> Result<ReviewRequest> {
        let span = info_span!("request_review", session_id = %session.id, %phase);
        let _guard = span.enter();

        if has_pending_review(session, phase) {
            return Err(AppError::InvalidTransition(format!(
                "phase {phase} of session {} already awaits review",
                session.id
            )));
        }

        let request = ReviewRequest::new(session.id.clone(), phase, content, task_ids);
        session.pending_approvals.push(request.id.clone());
        session.reviews.insert(request.id.clone(), request.clone());
        session.touch();
        self.index_request(&request.id, &session.id);

        info!(
            request_id = %request.id,
            tasks = request.task_ids.len(),
            "review requested"
        );
        self.events.publish(&WorkflowEvent::ReviewRequested {
            session_id: session.id.clone(),
            request_id: request.id.clone(),
            phase,
            at: request.requested_at,
        });
        Ok(request)
    }

    /// Record a decision on a pending request.
    ///
    /// Returns `false` for an unknown or already-resolved request; the
    /// session is left untouched in that case.
    pub fn resolve(
        &self,
        session: &mut WorkflowSession,
        request_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> bool {
        let Some(request) = session.reviews.get_mut(request_id) else {
            return false;
        };
        if !request.is_pending() {
            return false;
        }

        let now = Utc::now();
        request.resolution = if approved {
            ReviewResolution::Approved
        } else {
            ReviewResolution::Rejected
        };
        request.feedback = feedback;
        request.resolved_at = Some(now);
        session.pending_approvals.retain(|id| id != request_id);
        session.touch();

        info!(session_id = %session.id, request_id, approved, "review resolved");
        self.events.publish(&WorkflowEvent::ReviewResolved {
            session_id: session.id.clone(),
            request_id: request_id.to_owned(),
            approved,
            at: now,
        });
        true
    }

    /// Session owning `request_id`, if the gate has seen it.
    #[must_use]
    pub fn session_for(&self, request_id: &str) -> Option<String> {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request_id)
            .cloned()
    }

    /// Index every request of a restored session.
    pub fn register_session(&self, session: &WorkflowSession) {
        for request_id in session.reviews.keys() {
            self.index_request(request_id, &session.id);
        }
    }

    /// Drop every index entry of `session_id`. Returns how many were removed.
    pub fn forget_session(&self, session_id: &str) -> usize {
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let before = index.len();
        index.retain(|_, owner| owner != session_id);
        before - index.len()
    }

    fn index_request(&self, request_id: &str, session_id: &str) {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.to_owned(), session_id.to_owned());
    }
}

/// Whether `phase` has an approved phase-completion review.
#[must_use]
pub fn phase_approved(session: &WorkflowSession, phase: Phase) -> bool {
    session.reviews.values().any(|review| {
        review.phase == phase
            && review.is_phase_review()
            && review.resolution == ReviewResolution::Approved
    })
}

/// Whether `phase` has a request still waiting on a reviewer.
#[must_use]
pub fn has_pending_review(session: &WorkflowSession, phase: Phase) -> bool {
    session
        .reviews
        .values()
        .any(|review| review.phase == phase && review.is_pending())
}
