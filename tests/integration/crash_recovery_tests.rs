//! Integration tests for checkpoint-based recovery.
//!
//! Simulates a process dying mid-phase, restores the session in a fresh
//! coordinator over the same store, and verifies checkpoint failures are
//! surfaced and retried.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use docflow::agent::AgentRegistry;
use docflow::events::WorkflowEvent;
use docflow::models::session::SessionStatus;
use docflow::models::task::TaskStatus;
use docflow::orchestrator::scheduler;
use docflow::persistence::{db, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use docflow::AppError;

use super::test_helpers::{
    config, coordinator_with_store, drain, no_context, record_events, shared, wait_for, EchoAgent,
    FlakyStore, GatedAgent, SwitchableAgent,
};

const THREE_TASKS: &str = r#"
[agents.intake]
max_concurrency = 2

[[phases.intake.tasks]]
id = "facts"
capability = "intake"

[[phases.intake.tasks]]
id = "parties"
capability = "intake"

[[phases.intake.tasks]]
id = "summary"
capability = "summarize"
depends_on = ["facts"]
"#;

#[tokio::test]
async fn restore_after_crash_resumes_remaining_work() {
    let cfg = config(THREE_TASKS);
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());

    // First process: the summary agent never returns.
    let gated = Arc::new(GatedAgent::new());
    let crashed = coordinator_with_store(
        &cfg,
        AgentRegistry::builder()
            .register_configured(&cfg, "intake", Arc::new(EchoAgent::default()))
            .register("summarize", Arc::clone(&gated) as _, 1)
            .build()
            .expect("registry"),
        Arc::clone(&store),
    );
    let id = crashed
        .start_session("case-400", Vec::new(), no_context())
        .await
        .expect("start");
    let mut status = crashed.subscribe_status(&id).expect("watch");
    let in_flight = wait_for(&mut status, |s| {
        s.counts.completed == 2 && s.counts.in_progress == 1
    })
    .await;
    assert_eq!(in_flight.tasks["summary"], TaskStatus::InProgress);

    // Second process over the same store.
    let (summarizer, summarizer_dyn) = shared(EchoAgent::default());
    let recovered = coordinator_with_store(
        &cfg,
        AgentRegistry::builder()
            .register_configured(&cfg, "intake", Arc::new(EchoAgent::default()))
            .register("summarize", summarizer_dyn, 1)
            .build()
            .expect("registry"),
        Arc::clone(&store),
    );

    let restored = recovered.checkpoints().restore(&id).await.expect("restore");
    assert_eq!(restored.task("facts").expect("facts").status, TaskStatus::Completed);
    assert_eq!(
        restored.task("parties").expect("parties").status,
        TaskStatus::Completed
    );
    assert_eq!(
        restored.task("summary").expect("summary").status,
        TaskStatus::Pending
    );
    let ready: Vec<&str> = scheduler::ready_tasks(&restored)
        .into_iter()
        .map(|t| t.id.as_str())
        .collect();
    assert_eq!(ready, vec!["summary"]);

    assert_eq!(
        recovered.resume_session(&id).await.expect("resume"),
        SessionStatus::Running
    );
    assert_eq!(
        recovered.join(&id).await.expect("join"),
        SessionStatus::Completed
    );
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);

    crashed.abort_session(&id).await.expect("stop the stale driver");
}

#[tokio::test]
async fn resume_from_sqlite_after_restart() {
    let cfg = config(THREE_TASKS);
    let temp = tempfile::tempdir().expect("tempdir");
    let db_path = temp.path().join("state").join("docflow.db");

    let id = {
        let pool = Arc::new(db::connect(&db_path).await.expect("connect"));
        let offline = Arc::new(SwitchableAgent::default());
        let first = coordinator_with_store(
            &cfg,
            AgentRegistry::builder()
                .register_configured(&cfg, "intake", Arc::new(EchoAgent::default()))
                .register("summarize", offline as _, 1)
                .build()
                .expect("registry"),
            Arc::new(SqliteCheckpointStore::new(Arc::clone(&pool))),
        );
        let id = first
            .create_session("case-401", Vec::new(), no_context())
            .await
            .expect("create");
        assert_eq!(first.drive(&id).await.expect("drive"), SessionStatus::Running);
        pool.close().await;
        id
    };

    let pool = Arc::new(db::connect(&db_path).await.expect("reconnect"));
    let second = coordinator_with_store(
        &cfg,
        AgentRegistry::builder()
            .register_configured(&cfg, "intake", Arc::new(EchoAgent::default()))
            .register("summarize", Arc::new(EchoAgent::default()), 1)
            .build()
            .expect("registry"),
        Arc::new(SqliteCheckpointStore::new(pool)),
    );
    assert!(second.session_ids().is_empty());

    assert_eq!(
        second.resume_session(&id).await.expect("resume"),
        SessionStatus::Running
    );
    assert_eq!(second.join(&id).await.expect("join"), SessionStatus::Completed);

    let session = second.session(&id).await.expect("session");
    assert_eq!(session.case_id, "case-401");
    assert!(session
        .tasks
        .values()
        .all(|task| task.status == TaskStatus::Completed));
}

#[tokio::test]
async fn resume_unknown_session_reports_missing_checkpoint() {
    let cfg = config(THREE_TASKS);
    let coord = coordinator_with_store(
        &cfg,
        AgentRegistry::builder().build().expect("registry"),
        Arc::new(MemoryCheckpointStore::new()),
    );

    let err = coord.resume_session("ghost").await.expect_err("unknown");
    assert!(matches!(err, AppError::NoCheckpointFound(_)));
}

#[tokio::test]
async fn failed_checkpoint_is_surfaced_and_retried() {
    let cfg = config(
        r#"
[[phases.intake.tasks]]
id = "facts"
capability = "intake"
"#,
    );
    let store = Arc::new(FlakyStore::default());
    let coord = coordinator_with_store(
        &cfg,
        AgentRegistry::builder()
            .register("intake", Arc::new(EchoAgent::default()), 1)
            .build()
            .expect("registry"),
        Arc::clone(&store) as _,
    );
    let mut rx = record_events(&coord);

    let id = coord
        .create_session("case-402", Vec::new(), no_context())
        .await
        .expect("create");
    store.fail_saves.store(true, Ordering::SeqCst);

    let err = coord.drive(&id).await.expect_err("checkpoint must fail");
    assert!(matches!(err, AppError::CheckpointIo(_)));
    assert_eq!(store.failed.load(Ordering::SeqCst), 1);

    let snapshot = coord.get_session_status(&id).expect("status");
    assert_eq!(snapshot.tasks["facts"], TaskStatus::Completed);
    assert!(
        drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WorkflowEvent::TaskCompleted { .. })),
        "events still published when the save fails"
    );

    store.fail_saves.store(false, Ordering::SeqCst);
    assert_eq!(coord.drive(&id).await.expect("drive"), SessionStatus::Completed);

    let history = coord.checkpoints().history(&id).await.expect("history");
    let reasons: Vec<&str> = history.iter().map(|cp| cp.reason.as_str()).collect();
    assert_eq!(reasons[0], "session_started");
    assert_eq!(reasons[1], "checkpoint_retry");
    assert_eq!(reasons.last(), Some(&"session_completed"));

    let restored = coord.checkpoints().restore(&id).await.expect("restore");
    assert_eq!(restored.status, SessionStatus::Completed);
}
