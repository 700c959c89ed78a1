//! Unit tests for the human review gate.

use std::sync::Arc;

use docflow::events::{EventBus, EventType, WorkflowEvent};
use docflow::models::phase::Phase;
use docflow::models::review::ReviewResolution;
use docflow::models::session::{Context, WorkflowSession};
use docflow::orchestrator::review_gate::{has_pending_review, phase_approved};
use docflow::orchestrator::ReviewGate;
use docflow::AppError;
use serde_json::json;

fn setup() -> (ReviewGate, Arc<EventBus>, WorkflowSession) {
    let events = Arc::new(EventBus::new());
    let gate = ReviewGate::new(Arc::clone(&events));
    let session = WorkflowSession::new("case-7".into(), Context::new());
    (gate, events, session)
}

#[test]
fn request_is_recorded_on_session_and_indexed() {
    let (gate, _events, mut session) = setup();

    let request = gate
        .request_review(&mut session, Phase::Outline, json!({"outline": "I. Facts"}), Vec::new())
        .expect("request");

    assert!(request.is_pending());
    assert!(request.is_phase_review());
    assert_eq!(session.pending_approvals, vec![request.id.clone()]);
    assert_eq!(session.reviews[&request.id], request);
    assert_eq!(gate.session_for(&request.id), Some(session.id.clone()));
    assert!(has_pending_review(&session, Phase::Outline));
    assert!(!phase_approved(&session, Phase::Outline));
}

#[test]
fn second_request_for_same_phase_is_refused() {
    let (gate, _events, mut session) = setup();
    gate.request_review(&mut session, Phase::Drafting, json!({}), Vec::new())
        .expect("first request");

    let err = gate
        .request_review(&mut session, Phase::Drafting, json!({}), vec!["memo".into()])
        .expect_err("phase already awaits review");
    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert_eq!(session.pending_approvals.len(), 1);
}

#[test]
fn approval_resolves_exactly_once() {
    let (gate, _events, mut session) = setup();
    let request = gate
        .request_review(&mut session, Phase::Outline, json!({}), Vec::new())
        .expect("request");

    assert!(gate.resolve(&mut session, &request.id, true, Some("looks good".into())));
    assert!(!gate.resolve(&mut session, &request.id, false, None));

    let stored = &session.reviews[&request.id];
    assert_eq!(stored.resolution, ReviewResolution::Approved);
    assert_eq!(stored.feedback.as_deref(), Some("looks good"));
    assert!(stored.resolved_at.is_some());
    assert!(session.pending_approvals.is_empty());
    assert!(phase_approved(&session, Phase::Outline));
}

#[test]
fn rejection_is_recorded() {
    let (gate, _events, mut session) = setup();
    let request = gate
        .request_review(&mut session, Phase::Review, json!({}), vec!["memo".into()])
        .expect("request");

    assert!(gate.resolve(&mut session, &request.id, false, Some("cite sources".into())));
    assert_eq!(
        session.reviews[&request.id].resolution,
        ReviewResolution::Rejected
    );
    assert!(!phase_approved(&session, Phase::Review));
}

#[test]
fn task_review_approval_does_not_approve_phase() {
    let (gate, _events, mut session) = setup();
    let request = gate
        .request_review(&mut session, Phase::Drafting, json!({}), vec!["memo".into()])
        .expect("request");
    assert!(gate.resolve(&mut session, &request.id, true, None));

    assert!(!phase_approved(&session, Phase::Drafting));
}

#[test]
fn unknown_request_is_not_resolved() {
    let (gate, _events, mut session) = setup();
    assert!(!gate.resolve(&mut session, "missing", true, None));
    assert!(gate.session_for("missing").is_none());
}

#[test]
fn request_and_resolution_are_published() {
    let (gate, events, mut session) = setup();
    let mut rx = events.subscribe_channel(&[EventType::ReviewRequested, EventType::ReviewResolved]);

    let request = gate
        .request_review(&mut session, Phase::Editing, json!({}), Vec::new())
        .expect("request");
    gate.resolve(&mut session, &request.id, true, None);
    gate.resolve(&mut session, &request.id, true, None);

    let first = rx.try_recv().expect("requested event");
    assert!(matches!(
        first,
        WorkflowEvent::ReviewRequested { ref request_id, phase: Phase::Editing, .. } if *request_id == request.id
    ));
    let second = rx.try_recv().expect("resolved event");
    assert!(matches!(
        second,
        WorkflowEvent::ReviewResolved { approved: true, .. }
    ));
    assert!(rx.try_recv().is_err(), "duplicate resolution publishes nothing");
}

#[test]
fn restored_session_requests_are_reindexed() {
    let (gate, events, mut session) = setup();
    let request = gate
        .request_review(&mut session, Phase::Outline, json!({}), Vec::new())
        .expect("request");

    let fresh = ReviewGate::new(events);
    assert!(fresh.session_for(&request.id).is_none());
    fresh.register_session(&session);
    assert_eq!(fresh.session_for(&request.id), Some(session.id.clone()));
}

#[test]
fn forgetting_a_session_drops_only_its_requests() {
    let (gate, _events, mut session) = setup();
    let mut other = WorkflowSession::new("case-8".into(), Context::new());
    let mine = gate
        .request_review(&mut session, Phase::Outline, json!({}), Vec::new())
        .expect("request");
    let theirs = gate
        .request_review(&mut other, Phase::Outline, json!({}), Vec::new())
        .expect("other request");

    assert_eq!(gate.forget_session(&session.id), 1);
    assert!(gate.session_for(&mine.id).is_none());
    assert_eq!(gate.session_for(&theirs.id), Some(other.id.clone()));
    assert_eq!(gate.forget_session(&session.id), 0);
}
