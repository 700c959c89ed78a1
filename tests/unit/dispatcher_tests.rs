//! Unit tests for the batch dispatcher.
//!
//! Validates submission-order results, per-capability concurrency bounds,
//! failure isolation between jobs, panic capture, unavailable capabilities
//! and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docflow::agent::{Agent, AgentError, AgentFuture, AgentOutput, AgentRegistry};
use docflow::models::session::Context;
use docflow::orchestrator::{DispatchJob, Dispatcher, TaskOutcome};
use serde_json::json;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

// ── test agents ──────────────────────────────────────────────────────

/// Returns its input, optionally after a delay, recording call order.
#[derive(Default)]
struct Echo {
    delay_ms: u64,
    calls: Mutex<Vec<String>>,
}

impl Agent for Echo {
    fn execute(&self, input: serde_json::Value, _context: Context) -> AgentFuture<'_> {
        Box::pin(async move {
            if let Some(name) = input["name"].as_str() {
                self.calls.lock().unwrap().push(name.to_owned());
            }
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(AgentOutput::new(input))
        })
    }
}

/// Tracks how many invocations overlap.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Agent for Gauge {
    fn execute(&self, input: serde_json::Value, _context: Context) -> AgentFuture<'_> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(AgentOutput::new(input))
        })
    }
}

struct Broken;

impl Agent for Broken {
    fn execute(&self, _input: serde_json::Value, _context: Context) -> AgentFuture<'_> {
        Box::pin(async { Err(AgentError::Execution("model returned garbage".into())) })
    }
}

struct Panicky;

impl Agent for Panicky {
    fn execute(&self, _input: serde_json::Value, _context: Context) -> AgentFuture<'_> {
        Box::pin(async {
            let explode = true;
            if explode {
                panic!("agent exploded");
            }
            Ok(AgentOutput::default())
        })
    }
}

/// Panics while building the future for inputs named "boom".
#[derive(Default)]
struct EagerPanicky {
    calls: AtomicUsize,
}

impl Agent for EagerPanicky {
    fn execute(&self, input: serde_json::Value, _context: Context) -> AgentFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_ne!(input["name"], "boom", "agent rejected input eagerly");
        Box::pin(async move { Ok(AgentOutput::new(input)) })
    }
}

struct Offline;

impl Agent for Offline {
    fn execute(&self, input: serde_json::Value, _context: Context) -> AgentFuture<'_> {
        Box::pin(async move { Ok(AgentOutput::new(input)) })
    }

    fn is_available(&self) -> bool {
        false
    }
}

struct Hang;

impl Agent for Hang {
    fn execute(&self, _input: serde_json::Value, _context: Context) -> AgentFuture<'_> {
        Box::pin(async {
            std::future::pending::<()>().await;
            Ok(AgentOutput::default())
        })
    }
}

fn job(task_id: &str, capability: &str) -> DispatchJob {
    DispatchJob {
        task_id: task_id.into(),
        capability: capability.into(),
        input: json!({ "name": task_id }),
        context: Context::new(),
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn results_follow_submission_order() {
    let registry = AgentRegistry::builder()
        .register(
            "slow",
            Arc::new(Echo {
                delay_ms: 30,
                ..Echo::default()
            }),
            2,
        )
        .register("fast", Arc::new(Echo::default()), 2)
        .build()
        .expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let jobs = vec![job("a", "slow"), job("b", "fast"), job("c", "slow"), job("d", "fast")];
    let results = dispatcher
        .execute_batch(jobs, &CancellationToken::new())
        .await;

    let order: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c", "d"]);
    for result in &results {
        match &result.outcome {
            TaskOutcome::Completed { output, .. } => {
                assert_eq!(output["name"], result.task_id.as_str());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(result.worker.is_some());
    }
}

#[tokio::test]
async fn single_worker_runs_jobs_fifo() {
    let echo = Arc::new(Echo::default());
    let registry = AgentRegistry::builder()
        .register("drafting", Arc::clone(&echo) as Arc<dyn Agent>, 1)
        .build()
        .expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let jobs = vec![
        job("first", "drafting"),
        job("second", "drafting"),
        job("third", "drafting"),
    ];
    dispatcher
        .execute_batch(jobs, &CancellationToken::new())
        .await;

    assert_eq!(*echo.calls.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
#[serial]
async fn concurrency_never_exceeds_capability_limit() {
    let gauge = Arc::new(Gauge::default());
    let registry = AgentRegistry::builder()
        .register("research", Arc::clone(&gauge) as Arc<dyn Agent>, 2)
        .build()
        .expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let jobs = (0..6).map(|i| job(&format!("t{i}"), "research")).collect();
    let results = dispatcher
        .execute_batch(jobs, &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 6);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[serial]
async fn limit_holds_across_concurrent_batches() {
    let gauge = Arc::new(Gauge::default());
    let registry = Arc::new(
        AgentRegistry::builder()
            .register("research", Arc::clone(&gauge) as Arc<dyn Agent>, 2)
            .build()
            .expect("registry"),
    );
    let first = Dispatcher::new(Arc::clone(&registry));
    let second = Dispatcher::new(registry);
    let cancel = CancellationToken::new();

    let batch_a = (0..3).map(|i| job(&format!("a{i}"), "research")).collect();
    let batch_b = (0..3).map(|i| job(&format!("b{i}"), "research")).collect();
    let (a, b) = tokio::join!(
        first.execute_batch(batch_a, &cancel),
        second.execute_batch(batch_b, &cancel)
    );

    assert_eq!(a.len() + b.len(), 6);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn failing_job_does_not_affect_siblings() {
    let registry = AgentRegistry::builder()
        .register("broken", Arc::new(Broken), 1)
        .register("echo", Arc::new(Echo::default()), 1)
        .build()
        .expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let results = dispatcher
        .execute_batch(
            vec![job("bad", "broken"), job("good", "echo")],
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(
        results[0].outcome,
        TaskOutcome::Failed {
            error: "model returned garbage".into()
        }
    );
    assert!(matches!(results[1].outcome, TaskOutcome::Completed { .. }));
}

#[tokio::test]
async fn panic_becomes_failed_outcome() {
    let registry = AgentRegistry::builder()
        .register("panicky", Arc::new(Panicky), 1)
        .register("echo", Arc::new(Echo::default()), 1)
        .build()
        .expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let results = dispatcher
        .execute_batch(
            vec![job("boom", "panicky"), job("fine", "echo")],
            &CancellationToken::new(),
        )
        .await;

    match &results[0].outcome {
        TaskOutcome::Failed { error } => {
            assert_eq!(error, "agent panicked: agent exploded");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(results[1].outcome, TaskOutcome::Completed { .. }));
}

#[tokio::test]
async fn panic_before_future_spares_queued_siblings() {
    let agent = Arc::new(EagerPanicky::default());
    let registry = AgentRegistry::builder()
        .register("drafting", Arc::clone(&agent) as _, 1)
        .build()
        .expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let results = dispatcher
        .execute_batch(
            vec![
                job("boom", "drafting"),
                job("memo", "drafting"),
                job("exhibits", "drafting"),
            ],
            &CancellationToken::new(),
        )
        .await;

    match &results[0].outcome {
        TaskOutcome::Failed { error } => {
            assert!(error.starts_with("agent panicked: "), "{error}");
            assert!(error.contains("agent rejected input eagerly"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(results[1].outcome, TaskOutcome::Completed { .. }));
    assert!(matches!(results[2].outcome, TaskOutcome::Completed { .. }));
    assert_eq!(results[2].worker, results[1].worker, "same worker kept draining");
    assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unregistered_capability_is_unavailable() {
    let registry = AgentRegistry::builder().build().expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let results = dispatcher
        .execute_batch(vec![job("t1", "translation")], &CancellationToken::new())
        .await;

    assert!(results[0].outcome.is_unavailable());
    assert!(results[0].worker.is_none());
}

#[tokio::test]
async fn unhealthy_agent_is_unavailable_and_never_called() {
    let registry = AgentRegistry::builder()
        .register("research", Arc::new(Offline), 2)
        .build()
        .expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let results = dispatcher
        .execute_batch(
            vec![job("t1", "research"), job("t2", "research")],
            &CancellationToken::new(),
        )
        .await;

    assert!(results.iter().all(|r| r.outcome.is_unavailable()));
}

#[tokio::test]
async fn cancellation_resolves_in_flight_and_queued_jobs() {
    let registry = AgentRegistry::builder()
        .register("drafting", Arc::new(Hang), 1)
        .build()
        .expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let results = dispatcher
        .execute_batch(vec![job("t1", "drafting"), job("t2", "drafting")], &cancel)
        .await;

    assert!(results
        .iter()
        .all(|r| r.outcome == TaskOutcome::Cancelled));
}

#[tokio::test]
async fn empty_batch_returns_nothing() {
    let registry = AgentRegistry::builder().build().expect("registry");
    let dispatcher = Dispatcher::new(Arc::new(registry));
    let results = dispatcher
        .execute_batch(Vec::new(), &CancellationToken::new())
        .await;
    assert!(results.is_empty());
}
