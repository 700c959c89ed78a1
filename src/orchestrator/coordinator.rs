//! Workflow coordinator: owns sessions and drives them through the phases.
//!
//! Each session lives in a slot holding its execution lock (a
//! `tokio::sync::Mutex` around the session), a `watch` channel carrying the
//! last consistent [`StatusSnapshot`], and a cancellation token for aborts.
//! A driver loop holds the execution lock while it plans, dispatches and
//! applies batches; readers only ever see the snapshot published after a
//! batch was fully applied.
//!
//! Finished sessions stay in memory until the host archives them with
//! [`WorkflowCoordinator::archive_session`] or
//! [`WorkflowCoordinator::archive_finished`]; an archived session lives on
//! in the checkpoint store and can be brought back with
//! [`WorkflowCoordinator::resume_session`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::checkpoint_manager::CheckpointManager;
use super::dispatcher::{DispatchJob, DispatchResult, Dispatcher, TaskOutcome};
use super::planner::TaskPlanner;
use super::review_gate::{self, ReviewGate};
use super::scheduler;
use crate::agent::AgentRegistry;
use crate::config::GlobalConfig;
use crate::events::{EventBus, WorkflowEvent};
use crate::models::phase::{Phase, PhaseStatus};
use crate::models::review::ReviewRequest;
use crate::models::session::{Context, SessionStatus, WorkflowSession};
use crate::models::task::TaskStatus;
use crate::persistence::store::CheckpointStore;
use crate::{AppError, Result};

/// Context key holding the documents a session was started with.
pub const INITIAL_DOCUMENTS_KEY: &str = "initial_documents";

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TaskCounts {
    /// Waiting for prerequisites or a dispatch slot.
    pub pending: usize,
    /// Dispatched in the running batch.
    pub in_progress: usize,
    /// Output accepted.
    pub completed: usize,
    /// Failed for good.
    pub failed: usize,
    /// Output waiting on a reviewer.
    pub awaiting_review: usize,
    /// Cancelled by an abort.
    pub cancelled: usize,
}

/// Read-only view of a session, published after every consistent change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    /// Session identifier.
    pub session_id: String,
    /// Case the session produces documents for.
    pub case_id: String,
    /// Overall lifecycle status.
    pub status: SessionStatus,
    /// Phase the pipeline sits in.
    pub current_phase: Phase,
    /// Status of every phase.
    pub phases: BTreeMap<Phase, PhaseStatus>,
    /// Status of every planned task.
    pub tasks: BTreeMap<String, TaskStatus>,
    /// Task totals by status.
    pub counts: TaskCounts,
    /// Review requests awaiting a decision.
    pub pending_reviews: Vec<String>,
    /// Pending tasks that can never run because something upstream failed.
    pub blocked_tasks: Vec<String>,
    /// Failure diagnostic, if the session failed.
    pub failure: Option<String>,
    /// Sequence number of the latest checkpoint taken.
    pub checkpoint_seq: u64,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Build a snapshot of `session`.
    #[must_use]
    pub fn from_session(session: &WorkflowSession) -> Self {
        let mut counts = TaskCounts::default();
        for task in session.tasks.values() {
            let slot = match task.status {
                TaskStatus::Pending => &mut counts.pending,
                TaskStatus::InProgress => &mut counts.in_progress,
                TaskStatus::Completed => &mut counts.completed,
                TaskStatus::Failed => &mut counts.failed,
                TaskStatus::AwaitingReview => &mut counts.awaiting_review,
                TaskStatus::Cancelled => &mut counts.cancelled,
            };
            *slot += 1;
        }

        Self {
            session_id: session.id.clone(),
            case_id: session.case_id.clone(),
            status: session.status,
            current_phase: session.current_phase,
            phases: session.phases.clone(),
            tasks: session
                .tasks
                .iter()
                .map(|(id, task)| (id.clone(), task.status))
                .collect(),
            counts,
            pending_reviews: session.pending_approvals.clone(),
            blocked_tasks: scheduler::blocked_tasks(session),
            failure: session.failure.clone(),
            checkpoint_seq: session.checkpoint_seq,
            updated_at: session.updated_at,
        }
    }
}

struct SessionSlot {
    session: Mutex<WorkflowSession>,
    view: watch::Sender<StatusSnapshot>,
    cancel: CancellationToken,
    drivers: StdMutex<Vec<JoinHandle<()>>>,
    checkpoint_pending: AtomicBool,
}

enum Step {
    Continue,
    Suspend,
}

/// Owns workflow sessions and drives them from intake to finalization.
pub struct WorkflowCoordinator {
    config: Arc<GlobalConfig>,
    dispatcher: Dispatcher,
    planner: Arc<dyn TaskPlanner>,
    checkpoints: CheckpointManager,
    events: Arc<EventBus>,
    reviews: ReviewGate,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl WorkflowCoordinator {
    /// Create a coordinator.
    ///
    /// The registry, planner, store and event bus are shared with the
    /// caller; nothing is looked up globally.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        registry: Arc<AgentRegistry>,
        planner: Arc<dyn TaskPlanner>,
        store: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            dispatcher: Dispatcher::new(registry),
            planner,
            checkpoints: CheckpointManager::new(store),
            reviews: ReviewGate::new(Arc::clone(&events)),
            events,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Event bus lifecycle notifications are published on.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Checkpoint manager used for every snapshot.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Ids of the sessions held in memory, sorted.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Create a session, plan its first phase and checkpoint it, without
    /// starting a driver.
    ///
    /// `initial_documents` are stored in the global context under
    /// [`INITIAL_DOCUMENTS_KEY`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Plan` if the first phase cannot be planned, or
    /// `AppError::CheckpointIo` if the initial checkpoint fails.
    pub async fn create_session(
        &self,
        case_id: impl Into<String>,
        initial_documents: Vec<Value>,
        initial_context: Context,
    ) -> Result<String> {
        let mut context = initial_context;
        context.insert(
            INITIAL_DOCUMENTS_KEY.to_owned(),
            Value::Array(initial_documents),
        );
        let mut session = WorkflowSession::new(case_id.into(), context);
        let span = info_span!(
            "create_session",
            session_id = %session.id,
            case_id = %session.case_id
        );

        async move {
            let first = Phase::first();
            self.plan_phase(&mut session, first)?;
            session.set_phase_status(first, PhaseStatus::Running);
            session.transition(SessionStatus::Running)?;
            self.checkpoints
                .snapshot(&mut session, "session_started")
                .await?;

            let event = WorkflowEvent::SessionStarted {
                session_id: session.id.clone(),
                case_id: session.case_id.clone(),
                at: Utc::now(),
            };
            let session_id = session.id.clone();
            self.register(session);
            info!("session started");
            self.events.publish(&event);
            Ok::<_, AppError>(session_id)
        }
        .instrument(span)
        .await
    }

    /// Create a session and drive it in the background.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create_session`].
    pub async fn start_session(
        self: &Arc<Self>,
        case_id: impl Into<String>,
        initial_documents: Vec<Value>,
        initial_context: Context,
    ) -> Result<String> {
        let session_id = self
            .create_session(case_id, initial_documents, initial_context)
            .await?;
        let slot = self.slot(&session_id)?;
        self.spawn_driver(&slot, &session_id);
        Ok(session_id)
    }

    /// Drive a session inline until it suspends or reaches a terminal
    /// status, and return the status it stopped in.
    ///
    /// A session left `Running` is stalled: nothing is runnable until an
    /// external event (an agent coming back, a resume) arrives.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session and
    /// `AppError::CheckpointIo` if a checkpoint cannot be saved; the save is
    /// retried when the session is driven again.
    pub async fn drive(&self, session_id: &str) -> Result<SessionStatus> {
        let slot = self.slot(session_id)?;
        let span = info_span!("drive", session_id);
        async {
            let mut session = slot.session.lock().await;
            let outcome = self.run_until_suspended(&slot, &mut session).await;
            publish_view(&slot, &session);
            outcome.map(|()| session.status)
        }
        .instrument(span)
        .await
    }

    /// Wait for every background driver of a session to finish, then
    /// return its status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or
    /// `AppError::Internal` if a driver panicked.
    pub async fn join(&self, session_id: &str) -> Result<SessionStatus> {
        let slot = self.slot(session_id)?;
        loop {
            let handles =
                std::mem::take(&mut *slot.drivers.lock().unwrap_or_else(PoisonError::into_inner));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                handle.await.map_err(|err| {
                    AppError::Internal(format!("driver for session {session_id} failed: {err}"))
                })?;
            }
        }
        let status = slot.view.borrow().status;
        Ok(status)
    }

    /// Last consistent status of a session. Never blocks on a running batch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub fn get_session_status(&self, session_id: &str) -> Result<StatusSnapshot> {
        let slot = self.slot(session_id)?;
        let snapshot = slot.view.borrow().clone();
        Ok(snapshot)
    }

    /// Watch a session's status snapshots.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub fn subscribe_status(&self, session_id: &str) -> Result<watch::Receiver<StatusSnapshot>> {
        Ok(self.slot(session_id)?.view.subscribe())
    }

    /// Full copy of a session's state. Waits for a running batch to finish.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn session(&self, session_id: &str) -> Result<WorkflowSession> {
        let slot = self.slot(session_id)?;
        let session = slot.session.lock().await;
        Ok(session.clone())
    }

    /// Record a reviewer decision.
    ///
    /// Returns `Ok(true)` when this call resolved the request and
    /// `Ok(false)` when it had already been resolved (or the session has
    /// since ended). Approval resumes the driver; rejection fails the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownReviewRequest` for an id the coordinator
    /// never issued, or `AppError::CheckpointIo` if the resulting state
    /// cannot be checkpointed.
    pub async fn submit_review(
        self: &Arc<Self>,
        request_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<bool> {
        let session_id = self
            .reviews
            .session_for(request_id)
            .ok_or_else(|| AppError::UnknownReviewRequest(request_id.to_owned()))?;
        let slot = self.slot(&session_id)?;
        let span = info_span!("submit_review", session_id = %session_id, request_id, approved);

        let resolved = async {
            let mut session = slot.session.lock().await;
            let request = session
                .reviews
                .get(request_id)
                .cloned()
                .ok_or_else(|| AppError::UnknownReviewRequest(request_id.to_owned()))?;
            if session.status.is_terminal() || !request.is_pending() {
                info!("review already resolved");
                return Ok(None);
            }

            let note = feedback.clone();
            if !self
                .reviews
                .resolve(&mut session, request_id, approved, feedback)
            {
                return Ok(None);
            }

            let outcome = if approved {
                self.apply_approval(&slot, &mut session, &request).await
            } else {
                self.apply_rejection(&slot, &mut session, &request, note)
                    .await
            };
            publish_view(&slot, &session);
            outcome?;
            Ok::<_, AppError>(Some(session.status))
        }
        .instrument(span)
        .await?;

        match resolved {
            None => Ok(false),
            Some(status) => {
                if status == SessionStatus::Running {
                    self.spawn_driver(&slot, &session_id);
                }
                Ok(true)
            }
        }
    }

    /// Abort a session: cancel in-flight agent calls, cancel every open
    /// task and take a final checkpoint. A no-op on terminal sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session or
    /// `AppError::CheckpointIo` if the final checkpoint fails.
    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        let slot = self.slot(session_id)?;
        let span = info_span!("abort_session", session_id);
        async {
            slot.cancel.cancel();
            let mut session = slot.session.lock().await;
            if session.status.is_terminal() {
                info!(status = ?session.status, "session already finished");
                return Ok(());
            }

            let open: Vec<String> = session
                .tasks
                .values()
                .filter(|task| {
                    matches!(
                        task.status,
                        TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::AwaitingReview
                    )
                })
                .map(|task| task.id.clone())
                .collect();
            for task_id in &open {
                session.set_task_status(task_id, TaskStatus::Cancelled)?;
            }
            session.transition(SessionStatus::Aborted)?;
            info!(cancelled_tasks = open.len(), "session aborted");

            let event = WorkflowEvent::SessionAborted {
                session_id: session.id.clone(),
                at: Utc::now(),
            };
            self.commit(&slot, &mut session, "session_aborted", vec![event])
                .await
        }
        .instrument(span)
        .await
    }

    /// Evict a finished session from memory.
    ///
    /// Its last checkpoint stays in the store, so [`Self::resume_session`]
    /// brings it back. A checkpoint still owed from an earlier failed save
    /// is written first. Review ids of an archived session are no longer
    /// routable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::InvalidTransition` if the session has not finished, or
    /// `AppError::CheckpointIo` if the owed checkpoint cannot be saved.
    pub async fn archive_session(&self, session_id: &str) -> Result<()> {
        let slot = self.slot(session_id)?;
        {
            let mut session = slot.session.lock().await;
            if !session.status.is_terminal() {
                return Err(AppError::InvalidTransition(format!(
                    "session {session_id} is {:?} and cannot be archived",
                    session.status
                )));
            }
            if slot.checkpoint_pending.load(Ordering::Acquire) {
                self.checkpoint(&slot, &mut session, "checkpoint_retry")
                    .await?;
            }
        }

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        let reviews = self.reviews.forget_session(session_id);
        info!(session_id, reviews, "session archived");
        Ok(())
    }

    /// Archive every finished session held in memory and return their ids.
    ///
    /// Sessions whose owed checkpoint still fails to save stay in memory.
    pub async fn archive_finished(&self) -> Vec<String> {
        let mut archived = Vec::new();
        for session_id in self.session_ids() {
            let finished = self
                .find_slot(&session_id)
                .is_some_and(|slot| slot.view.borrow().status.is_terminal());
            if !finished {
                continue;
            }
            match self.archive_session(&session_id).await {
                Ok(()) => archived.push(session_id),
                Err(err) => warn!(session_id = %session_id, %err, "session not archived"),
            }
        }
        archived
    }

    /// Bring a session back after a restart and resume driving it.
    ///
    /// A session not held in memory is restored from its latest
    /// checkpoint; tasks that were in flight are dispatched again.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoCheckpointFound` if the session is unknown to
    /// both the coordinator and the store, or `AppError::CheckpointIo` if
    /// the checkpoint is unusable.
    pub async fn resume_session(self: &Arc<Self>, session_id: &str) -> Result<SessionStatus> {
        let slot = if let Some(slot) = self.find_slot(session_id) {
            slot
        } else {
            let session = self.checkpoints.restore(session_id).await?;
            self.reviews.register_session(&session);
            self.register(session)
        };

        let status = slot.session.lock().await.status;
        info!(session_id, ?status, "session resumed");
        if status == SessionStatus::Running {
            self.spawn_driver(&slot, session_id);
        }
        Ok(status)
    }

    fn register(&self, session: WorkflowSession) -> Arc<SessionSlot> {
        let (view, _) = watch::channel(StatusSnapshot::from_session(&session));
        let session_id = session.id.clone();
        let slot = Arc::new(SessionSlot {
            session: Mutex::new(session),
            view,
            cancel: CancellationToken::new(),
            drivers: StdMutex::new(Vec::new()),
            checkpoint_pending: AtomicBool::new(false),
        });
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, Arc::clone(&slot));
        slot
    }

    fn find_slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        self.find_slot(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    fn spawn_driver(self: &Arc<Self>, slot: &SessionSlot, session_id: &str) {
        let coordinator = Arc::clone(self);
        let session_id = session_id.to_owned();
        let handle = tokio::spawn(async move {
            if let Err(err) = coordinator.drive(&session_id).await {
                error!(session_id = %session_id, %err, "session driver stopped");
            }
        });
        slot.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    async fn run_until_suspended(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
    ) -> Result<()> {
        if slot.checkpoint_pending.load(Ordering::Acquire) {
            warn!("retrying checkpoint after an earlier failed save");
            self.checkpoint(slot, session, "checkpoint_retry").await?;
        }

        while session.status == SessionStatus::Running && !slot.cancel.is_cancelled() {
            match self.step(slot, session).await? {
                Step::Continue => {}
                Step::Suspend => break,
            }
        }
        Ok(())
    }

    async fn step(&self, slot: &SessionSlot, session: &mut WorkflowSession) -> Result<Step> {
        let failed = scheduler::failed_tasks(session);
        if !failed.is_empty() {
            let blocked = scheduler::blocked_tasks(session);
            let reason = format!(
                "tasks failed: {}; blocked: {}",
                failed.join(", "),
                if blocked.is_empty() {
                    "none".to_owned()
                } else {
                    blocked.join(", ")
                }
            );
            self.fail_session(slot, session, reason, Vec::new()).await?;
            return Ok(Step::Suspend);
        }

        let phase = session.current_phase;
        if scheduler::is_phase_complete(session, phase) {
            if self.config.requires_approval(phase) && !review_gate::phase_approved(session, phase)
            {
                self.request_review(slot, session, phase, Vec::new()).await?;
                return Ok(Step::Suspend);
            }
            return self.advance_phase(slot, session).await;
        }

        let ready: Vec<String> = scheduler::ready_tasks(session)
            .into_iter()
            .map(|task| task.id.clone())
            .collect();
        if !ready.is_empty() {
            if self.run_batch(slot, session, &ready).await? {
                self.stall(session, "no agent available for any task in the batch");
                return Ok(Step::Suspend);
            }
            return Ok(Step::Continue);
        }

        let awaiting = scheduler::tasks_awaiting_review(session, phase);
        if !awaiting.is_empty() {
            self.request_review(slot, session, phase, awaiting).await?;
            return Ok(Step::Suspend);
        }

        self.stall(session, "no runnable tasks");
        Ok(Step::Suspend)
    }

    /// Plan `phase` into the task arena.
    fn plan_phase(&self, session: &mut WorkflowSession, phase: Phase) -> Result<usize> {
        let plan = self.planner.plan(phase, session)?;
        if let Some(stray) = plan.iter().find(|task| task.phase != phase) {
            return Err(AppError::Plan(format!(
                "task {} belongs to phase {}, not {phase}",
                stray.id, stray.phase
            )));
        }
        scheduler::validate_plan(session, &plan)?;
        let count = plan.len();
        session.insert_plan(plan)?;
        info!(%phase, tasks = count, "phase planned");
        Ok(count)
    }

    async fn advance_phase(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
    ) -> Result<Step> {
        let from = session.current_phase;
        session.set_phase_status(from, PhaseStatus::Completed);

        let Some(to) = scheduler::next_phase(from) else {
            session.transition(SessionStatus::Completed)?;
            info!("session completed");
            let event = WorkflowEvent::SessionCompleted {
                session_id: session.id.clone(),
                at: Utc::now(),
            };
            self.commit(slot, session, "session_completed", vec![event])
                .await?;
            return Ok(Step::Suspend);
        };

        if let Err(err) = self.plan_phase(session, to) {
            let reason = format!("planning phase {to} failed: {err}");
            self.fail_session(slot, session, reason, Vec::new()).await?;
            return Ok(Step::Suspend);
        }
        session.current_phase = to;
        session.set_phase_status(to, PhaseStatus::Running);
        info!(%from, %to, "phase transitioned");

        let event = WorkflowEvent::PhaseTransitioned {
            session_id: session.id.clone(),
            from,
            to,
            at: Utc::now(),
        };
        self.commit(slot, session, "phase_transition", vec![event])
            .await?;
        Ok(Step::Continue)
    }

    async fn request_review(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
        phase: Phase,
        task_ids: Vec<String>,
    ) -> Result<()> {
        if review_gate::has_pending_review(session, phase) {
            if session.status == SessionStatus::Running {
                session.transition(SessionStatus::AwaitingReview)?;
            }
            return Ok(());
        }

        let content = review_content(session, phase, &task_ids);
        let phase_review = task_ids.is_empty();
        self.reviews
            .request_review(session, phase, content, task_ids)?;
        if phase_review {
            session.set_phase_status(phase, PhaseStatus::AwaitingReview);
        }
        session.transition(SessionStatus::AwaitingReview)?;
        self.checkpoint(slot, session, "review_requested").await
    }

    /// Dispatch one batch and apply its outcomes in ready order.
    ///
    /// Returns whether every job came back unavailable.
    async fn run_batch(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
        ready: &[String],
    ) -> Result<bool> {
        let span = info_span!("batch", phase = %session.current_phase, tasks = ready.len());
        async {
            let started = Utc::now();
            let mut jobs = Vec::with_capacity(ready.len());
            for task_id in ready {
                jobs.push(build_job(session, task_id)?);
                session.set_task_status(task_id, TaskStatus::InProgress)?;
                if let Some(task) = session.tasks.get_mut(task_id) {
                    task.started_at = Some(started);
                    task.ended_at = None;
                }
            }
            publish_view(slot, session);

            let results = self.dispatcher.execute_batch(jobs, &slot.cancel).await;
            let all_unavailable = results.iter().all(|r| r.outcome.is_unavailable());

            let mut events = Vec::with_capacity(results.len());
            for result in results {
                apply_outcome(session, result, &mut events)?;
            }
            self.commit(slot, session, "batch", events).await?;
            Ok::<_, AppError>(all_unavailable)
        }
        .instrument(span)
        .await
    }

    async fn apply_approval(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
        request: &ReviewRequest,
    ) -> Result<()> {
        session.transition(SessionStatus::Running)?;
        if request.is_phase_review() {
            self.advance_phase(slot, session).await?;
            return Ok(());
        }

        let mut events = Vec::new();
        for task_id in &request.task_ids {
            let Some(task) = session.tasks.get_mut(task_id) else {
                continue;
            };
            if task.status != TaskStatus::AwaitingReview {
                continue;
            }
            task.approval = Some(true);
            session.set_task_status(task_id, TaskStatus::Completed)?;
            info!(task_id = %task_id, "task output approved");
            events.push(WorkflowEvent::TaskCompleted {
                session_id: session.id.clone(),
                task_id: task_id.clone(),
                phase: request.phase,
                at: Utc::now(),
            });
        }
        self.commit(slot, session, "review_approved", events).await
    }

    async fn apply_rejection(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
        request: &ReviewRequest,
        feedback: Option<String>,
    ) -> Result<()> {
        let mut events = Vec::new();
        for task_id in &request.task_ids {
            let Some(task) = session.tasks.get_mut(task_id) else {
                continue;
            };
            if task.status != TaskStatus::AwaitingReview {
                continue;
            }
            task.approval = Some(false);
            task.last_error = Some("output rejected by reviewer".to_owned());
            session.set_task_status(task_id, TaskStatus::Failed)?;
            events.push(WorkflowEvent::TaskFailed {
                session_id: session.id.clone(),
                task_id: task_id.clone(),
                phase: request.phase,
                error: "output rejected by reviewer".to_owned(),
                at: Utc::now(),
            });
        }

        let mut reason = format!("review {} for phase {} rejected", request.id, request.phase);
        if let Some(feedback) = feedback {
            reason.push_str(": ");
            reason.push_str(&feedback);
        }
        self.fail_session(slot, session, reason, events).await
    }

    async fn fail_session(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
        reason: String,
        mut events: Vec<WorkflowEvent>,
    ) -> Result<()> {
        warn!(reason = %reason, "session failed");
        let phase = session.current_phase;
        session.set_phase_status(phase, PhaseStatus::Failed);
        session.failure = Some(reason.clone());
        session.transition(SessionStatus::Failed)?;
        events.push(WorkflowEvent::SessionFailed {
            session_id: session.id.clone(),
            reason,
            at: Utc::now(),
        });
        self.commit(slot, session, "session_failed", events).await
    }

    fn stall(&self, session: &WorkflowSession, reason: &str) {
        warn!(phase = %session.current_phase, reason, "session stalled");
        self.events.publish(&WorkflowEvent::SessionStalled {
            session_id: session.id.clone(),
            phase: session.current_phase,
            reason: reason.to_owned(),
            at: Utc::now(),
        });
    }

    /// Checkpoint, then publish `events` whether or not the save worked.
    async fn commit(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
        reason: &str,
        events: Vec<WorkflowEvent>,
    ) -> Result<()> {
        let saved = self.checkpoint(slot, session, reason).await;
        for event in &events {
            self.events.publish(event);
        }
        saved
    }

    async fn checkpoint(
        &self,
        slot: &SessionSlot,
        session: &mut WorkflowSession,
        reason: &str,
    ) -> Result<()> {
        let result = self.checkpoints.snapshot(session, reason).await;
        slot.checkpoint_pending
            .store(result.is_err(), Ordering::Release);
        publish_view(slot, session);
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(%err, reason, "checkpoint failed");
                Err(err)
            }
        }
    }
}

fn publish_view(slot: &SessionSlot, session: &WorkflowSession) {
    slot.view.send_replace(StatusSnapshot::from_session(session));
}

/// Task input plus a context snapshot: the global context merged with the
/// outputs of completed prerequisites, keyed by prerequisite id.
fn build_job(session: &WorkflowSession, task_id: &str) -> Result<DispatchJob> {
    let task = session
        .task(task_id)
        .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;

    let mut context = session.context.clone();
    for prereq in &task.prerequisites {
        if let Some(output) = session.task(prereq).and_then(|up| up.output.clone()) {
            context.insert(prereq.clone(), output);
        }
    }

    Ok(DispatchJob {
        task_id: task.id.clone(),
        capability: task.capability.clone(),
        input: task.input.clone(),
        context,
    })
}

fn apply_outcome(
    session: &mut WorkflowSession,
    result: DispatchResult,
    events: &mut Vec<WorkflowEvent>,
) -> Result<()> {
    let DispatchResult {
        task_id,
        worker,
        outcome,
    } = result;
    let session_id = session.id.clone();
    let now = Utc::now();

    let task = session
        .tasks
        .get_mut(&task_id)
        .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
    task.ended_at = Some(now);
    if worker.is_some() {
        task.assigned_agent = worker;
    }
    let phase = task.phase;

    match outcome {
        TaskOutcome::Completed {
            output,
            context_updates,
        } => {
            task.output = Some(output);
            task.last_error = None;
            if task.requires_approval {
                session.set_task_status(&task_id, TaskStatus::AwaitingReview)?;
                info!(task_id = %task_id, "task output awaits review");
            } else {
                session.set_task_status(&task_id, TaskStatus::Completed)?;
                info!(task_id = %task_id, "task completed");
                events.push(WorkflowEvent::TaskCompleted {
                    session_id,
                    task_id,
                    phase,
                    at: now,
                });
            }
            session.merge_context(context_updates);
        }
        TaskOutcome::Failed { error } => {
            task.retry_count += 1;
            task.last_error = Some(error.clone());
            let (retry_count, max_retries) = (task.retry_count, task.max_retries);
            if retry_count <= max_retries {
                session.set_task_status(&task_id, TaskStatus::Pending)?;
                warn!(
                    task_id = %task_id,
                    retry_count,
                    max_retries,
                    error = %error,
                    "task failed, requeued"
                );
                events.push(WorkflowEvent::TaskRequeued {
                    session_id,
                    task_id,
                    reason: error,
                    retry_count,
                    at: now,
                });
            } else {
                session.set_task_status(&task_id, TaskStatus::Failed)?;
                warn!(
                    task_id = %task_id,
                    retry_count,
                    error = %error,
                    "task failed, retries exhausted"
                );
                events.push(WorkflowEvent::TaskFailed {
                    session_id,
                    task_id,
                    phase,
                    error,
                    at: now,
                });
            }
        }
        TaskOutcome::Unavailable { reason } => {
            task.last_error = Some(reason.clone());
            let retry_count = task.retry_count;
            session.set_task_status(&task_id, TaskStatus::Pending)?;
            events.push(WorkflowEvent::TaskRequeued {
                session_id,
                task_id,
                reason,
                retry_count,
                at: now,
            });
        }
        TaskOutcome::Cancelled => {
            task.started_at = None;
            session.set_task_status(&task_id, TaskStatus::Pending)?;
        }
    }
    Ok(())
}

/// Outputs under review, keyed by task id. A phase review covers every
/// task of the phase.
fn review_content(session: &WorkflowSession, phase: Phase, task_ids: &[String]) -> Value {
    let outputs: serde_json::Map<String, Value> = session
        .tasks_in_phase(phase)
        .filter(|task| task_ids.is_empty() || task_ids.contains(&task.id))
        .map(|task| (task.id.clone(), task.output.clone().unwrap_or(Value::Null)))
        .collect();
    serde_json::json!({
        "case_id": session.case_id,
        "phase": phase,
        "outputs": outputs,
    })
}
