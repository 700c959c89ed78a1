//! In-process publish/subscribe for workflow lifecycle notifications.
//!
//! Handlers run synchronously inside [`EventBus::publish`], in
//! subscription order. A failing or panicking handler is logged and
//! skipped; it never reaches the publisher. Async observers use
//! [`EventBus::subscribe_channel`] to get a per-subscriber FIFO queue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::phase::Phase;
use crate::Result;

/// Event classification used for subscriptions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A session was created and its first phase planned.
    SessionStarted,
    /// A task's output was accepted.
    TaskCompleted,
    /// A task exhausted its retry budget or its output was rejected.
    TaskFailed,
    /// A task went back to pending (retry or unavailable agent).
    TaskRequeued,
    /// The session moved to the next phase.
    PhaseTransitioned,
    /// A review request was raised.
    ReviewRequested,
    /// A review request was approved or rejected.
    ReviewResolved,
    /// Nothing is runnable and the session waits on an external event.
    SessionStalled,
    /// The terminal phase completed.
    SessionCompleted,
    /// The session failed.
    SessionFailed,
    /// The session was aborted by an operator.
    SessionAborted,
}

impl EventType {
    /// Every event type.
    pub const ALL: [EventType; 11] = [
        EventType::SessionStarted,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::TaskRequeued,
        EventType::PhaseTransitioned,
        EventType::ReviewRequested,
        EventType::ReviewResolved,
        EventType::SessionStalled,
        EventType::SessionCompleted,
        EventType::SessionFailed,
        EventType::SessionAborted,
    ];
}

/// A lifecycle notification published by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Session created and first phase planned.
    SessionStarted {
        /// Session identifier.
        session_id: String,
        /// Case the session produces documents for.
        case_id: String,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Task output accepted.
    TaskCompleted {
        /// Session identifier.
        session_id: String,
        /// Completed task.
        task_id: String,
        /// Owning phase.
        phase: Phase,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Task failed for good.
    TaskFailed {
        /// Session identifier.
        session_id: String,
        /// Failed task.
        task_id: String,
        /// Owning phase.
        phase: Phase,
        /// Last error description.
        error: String,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Task returned to pending.
    TaskRequeued {
        /// Session identifier.
        session_id: String,
        /// Requeued task.
        task_id: String,
        /// Why the attempt did not stick.
        reason: String,
        /// Failed attempts so far.
        retry_count: u32,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Phase pointer advanced.
    PhaseTransitioned {
        /// Session identifier.
        session_id: String,
        /// Phase just completed.
        from: Phase,
        /// Phase now running.
        to: Phase,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Review request raised.
    ReviewRequested {
        /// Session identifier.
        session_id: String,
        /// Review request identifier.
        request_id: String,
        /// Phase under review.
        phase: Phase,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Review request resolved.
    ReviewResolved {
        /// Session identifier.
        session_id: String,
        /// Review request identifier.
        request_id: String,
        /// Reviewer decision.
        approved: bool,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Nothing runnable; waiting on an external event.
    SessionStalled {
        /// Session identifier.
        session_id: String,
        /// Current phase.
        phase: Phase,
        /// Why no progress is possible.
        reason: String,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Pipeline finished.
    SessionCompleted {
        /// Session identifier.
        session_id: String,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Session halted.
    SessionFailed {
        /// Session identifier.
        session_id: String,
        /// Diagnostic description.
        reason: String,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
    /// Session aborted by an operator.
    SessionAborted {
        /// Session identifier.
        session_id: String,
        /// Event timestamp.
        at: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    /// Classification of this event.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SessionStarted { .. } => EventType::SessionStarted,
            Self::TaskCompleted { .. } => EventType::TaskCompleted,
            Self::TaskFailed { .. } => EventType::TaskFailed,
            Self::TaskRequeued { .. } => EventType::TaskRequeued,
            Self::PhaseTransitioned { .. } => EventType::PhaseTransitioned,
            Self::ReviewRequested { .. } => EventType::ReviewRequested,
            Self::ReviewResolved { .. } => EventType::ReviewResolved,
            Self::SessionStalled { .. } => EventType::SessionStalled,
            Self::SessionCompleted { .. } => EventType::SessionCompleted,
            Self::SessionFailed { .. } => EventType::SessionFailed,
            Self::SessionAborted { .. } => EventType::SessionAborted,
        }
    }

    /// Session the event belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::TaskCompleted { session_id, .. }
            | Self::TaskFailed { session_id, .. }
            | Self::TaskRequeued { session_id, .. }
            | Self::PhaseTransitioned { session_id, .. }
            | Self::ReviewRequested { session_id, .. }
            | Self::ReviewResolved { session_id, .. }
            | Self::SessionStalled { session_id, .. }
            | Self::SessionCompleted { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::SessionAborted { session_id, .. } => session_id,
        }
    }

    /// When the event was produced.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionStarted { at, .. }
            | Self::TaskCompleted { at, .. }
            | Self::TaskFailed { at, .. }
            | Self::TaskRequeued { at, .. }
            | Self::PhaseTransitioned { at, .. }
            | Self::ReviewRequested { at, .. }
            | Self::ReviewResolved { at, .. }
            | Self::SessionStalled { at, .. }
            | Self::SessionCompleted { at, .. }
            | Self::SessionFailed { at, .. }
            | Self::SessionAborted { at, .. } => *at,
        }
    }
}

/// Receives published events.
///
/// Handlers observe; they must not mutate session state.
pub trait EventHandler: Send + Sync {
    /// Handle a single event.
    ///
    /// # Errors
    ///
    /// Any error is logged by the bus and otherwise ignored.
    fn handle(&self, event: &WorkflowEvent) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&WorkflowEvent) -> Result<()> + Send + Sync,
{
    fn handle(&self, event: &WorkflowEvent) -> Result<()> {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    types: Vec<EventType>,
    handler: Arc<dyn EventHandler>,
}

/// Synchronous fan-out of [`WorkflowEvent`]s to registered handlers.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the given event types.
    pub fn subscribe(
        &self,
        types: &[EventType],
        handler: impl EventHandler + 'static,
    ) -> SubscriptionId {
        self.subscribe_arc(types, Arc::new(handler))
    }

    /// Register a shared handler for the given event types.
    pub fn subscribe_arc(&self, types: &[EventType], handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                types: types.to_vec(),
                handler,
            });
        debug!(subscription = id.0, ?types, "event subscriber registered");
        id
    }

    /// Register `handler` for every event type.
    pub fn subscribe_all(&self, handler: impl EventHandler + 'static) -> SubscriptionId {
        self.subscribe(&EventType::ALL, handler)
    }

    /// Forward matching events into an unbounded channel.
    ///
    /// Events arrive in publish order. Once the receiver is dropped the
    /// subscription silently discards events.
    pub fn subscribe_channel(&self, types: &[EventType]) -> mpsc::UnboundedReceiver<WorkflowEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(types, move |event: &WorkflowEvent| -> Result<()> {
            let _ = tx.send(event.clone());
            Ok(())
        });
        rx
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        subscribers.len() != before
    }

    /// Drop every handler, most recently registered first.
    pub fn teardown(&self) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        while let Some(sub) = subscribers.pop() {
            debug!(subscription = sub.id.0, "event subscriber dropped");
        }
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every subscriber of its type, in subscription order.
    pub fn publish(&self, event: &WorkflowEvent) {
        let event_type = event.event_type();

        // Snapshot the matching handlers so a handler may (un)subscribe
        // without deadlocking on the registry lock.
        let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|sub| sub.types.contains(&event_type))
            .map(|sub| (sub.id, Arc::clone(&sub.handler)))
            .collect();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(
                        subscription = id.0,
                        ?event_type,
                        session_id = event.session_id(),
                        %err,
                        "event handler failed"
                    );
                }
                Err(_) => {
                    warn!(
                        subscription = id.0,
                        ?event_type,
                        session_id = event.session_id(),
                        "event handler panicked"
                    );
                }
            }
        }
    }
}
