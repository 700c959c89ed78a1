//! Agent dispatcher: runs a batch of ready tasks on bounded worker pools.
//!
//! Jobs are grouped by capability. Each group gets at most
//! `max_concurrency` workers draining a FIFO queue, and every invocation
//! additionally holds a permit from the capability's shared semaphore so
//! the bound also holds across sessions sharing one registry. Outcomes
//! come back in submission order whatever order the agents finish in.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::{AgentError, AgentPool, AgentRegistry};
use crate::models::session::Context;

/// One task handed to an agent.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    /// Task being executed.
    pub task_id: String,
    /// Capability that must serve the task.
    pub capability: String,
    /// Task input payload.
    pub input: serde_json::Value,
    /// Global context merged with prerequisite outputs.
    pub context: Context,
}

/// Result of one job, before the coordinator applies it to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The agent produced an output.
    Completed {
        /// Output payload.
        output: serde_json::Value,
        /// Context keys the agent asked to set.
        context_updates: Context,
    },
    /// The agent failed or panicked; consumes retry budget.
    Failed {
        /// Error description.
        error: String,
    },
    /// No agent could take the job; requeued for free.
    Unavailable {
        /// Why the capability could not serve the job.
        reason: String,
    },
    /// The session was aborted before the job finished.
    Cancelled,
}

impl TaskOutcome {
    /// Whether the outcome means no agent could run the job.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Outcome of a job plus the worker that ran it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    /// Task the outcome belongs to.
    pub task_id: String,
    /// Worker label (`capability#n`), `None` when no worker picked the job up.
    pub worker: Option<String>,
    /// What happened.
    pub outcome: TaskOutcome,
}

type Queue = Arc<Mutex<VecDeque<(usize, DispatchJob)>>>;

/// Executes batches against an injected [`AgentRegistry`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Registry backing this dispatcher.
    #[must_use]
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Run every job and wait for all of them.
    ///
    /// A failing job never cancels its siblings. Cancelling `cancel`
    /// resolves in-flight and queued jobs as [`TaskOutcome::Cancelled`].
    pub async fn execute_batch(
        &self,
        jobs: Vec<DispatchJob>,
        cancel: &CancellationToken,
    ) -> Vec<DispatchResult> {
        let span = info_span!("execute_batch", jobs = jobs.len());
        async move {
            let mut results: Vec<Option<DispatchResult>> = vec![None; jobs.len()];
            let task_ids: Vec<String> = jobs.iter().map(|job| job.task_id.clone()).collect();

            let mut groups: BTreeMap<String, VecDeque<(usize, DispatchJob)>> = BTreeMap::new();
            for (index, job) in jobs.into_iter().enumerate() {
                groups
                    .entry(job.capability.clone())
                    .or_default()
                    .push_back((index, job));
            }

            let mut workers = JoinSet::new();
            for (capability, queue) in groups {
                let Some(pool) = self.registry.pool(&capability) else {
                    warn!(capability = %capability, "no agent registered for capability");
                    let reason = format!("no agent registered for capability {capability}");
                    mark_unavailable(&mut results, queue, &reason);
                    continue;
                };
                if !pool.is_available() {
                    warn!(capability = %capability, "agent pool reports unavailable");
                    let reason = format!("agent for capability {capability} is unavailable");
                    mark_unavailable(&mut results, queue, &reason);
                    continue;
                }

                let worker_count = pool.max_concurrency().min(queue.len());
                debug!(
                    capability = %capability,
                    worker_count,
                    queued = queue.len(),
                    "starting worker pool"
                );
                let queue: Queue = Arc::new(Mutex::new(queue));
                for worker in 0..worker_count {
                    workers.spawn(run_worker(
                        format!("{capability}#{worker}"),
                        Arc::clone(&pool),
                        Arc::clone(&queue),
                        cancel.clone(),
                    ));
                }
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(finished) => {
                        for (index, result) in finished {
                            results[index] = Some(result);
                        }
                    }
                    Err(err) => warn!(%err, "dispatch worker terminated abnormally"),
                }
            }

            let results: Vec<DispatchResult> = results
                .into_iter()
                .zip(task_ids)
                .map(|(result, task_id)| {
                    result.unwrap_or_else(|| DispatchResult {
                        task_id,
                        worker: None,
                        outcome: TaskOutcome::Failed {
                            error: "dispatch worker terminated before reporting".into(),
                        },
                    })
                })
                .collect();

            info!(
                completed = results
                    .iter()
                    .filter(|r| matches!(r.outcome, TaskOutcome::Completed { .. }))
                    .count(),
                "batch finished"
            );
            results
        }
        .instrument(span)
        .await
    }
}

fn mark_unavailable(
    results: &mut [Option<DispatchResult>],
    queue: VecDeque<(usize, DispatchJob)>,
    reason: &str,
) {
    for (index, job) in queue {
        results[index] = Some(DispatchResult {
            task_id: job.task_id,
            worker: None,
            outcome: TaskOutcome::Unavailable {
                reason: reason.to_owned(),
            },
        });
    }
}

/// Drain `queue` one job at a time until it is empty.
async fn run_worker(
    label: String,
    pool: Arc<AgentPool>,
    queue: Queue,
    cancel: CancellationToken,
) -> Vec<(usize, DispatchResult)> {
    let mut finished = Vec::new();
    loop {
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some((index, job)) = next else {
            break;
        };

        let outcome = run_job(&label, &pool, &job, &cancel).await;
        finished.push((
            index,
            DispatchResult {
                task_id: job.task_id,
                worker: Some(label.clone()),
                outcome,
            },
        ));
    }
    finished
}

async fn run_job(
    label: &str,
    pool: &AgentPool,
    job: &DispatchJob,
    cancel: &CancellationToken,
) -> TaskOutcome {
    if cancel.is_cancelled() {
        return TaskOutcome::Cancelled;
    }

    let permits = pool.permits();
    let _permit = tokio::select! {
        biased;
        () = cancel.cancelled() => return TaskOutcome::Cancelled,
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                return TaskOutcome::Unavailable {
                    reason: format!("worker pool for {} is closed", pool.capability()),
                }
            }
        },
    };

    debug!(task_id = %job.task_id, worker = label, "task dispatched");
    let agent = pool.agent();
    let (input, context) = (job.input.clone(), job.context.clone());
    // `execute` itself may panic before handing back a future.
    let invocation = AssertUnwindSafe(async move { agent.execute(input, context).await })
        .catch_unwind();

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => return TaskOutcome::Cancelled,
        result = invocation => result,
    };

    match result {
        Ok(Ok(output)) => TaskOutcome::Completed {
            output: output.output,
            context_updates: output.context_updates,
        },
        Ok(Err(AgentError::Unavailable(reason))) => {
            warn!(task_id = %job.task_id, worker = label, reason = %reason, "agent unavailable");
            TaskOutcome::Unavailable { reason }
        }
        Ok(Err(AgentError::Execution(error))) => {
            warn!(task_id = %job.task_id, worker = label, error = %error, "agent execution failed");
            TaskOutcome::Failed { error }
        }
        Err(panic) => {
            let error = panic_message(panic.as_ref());
            warn!(task_id = %job.task_id, worker = label, error = %error, "agent panicked");
            TaskOutcome::Failed {
                error: format!("agent panicked: {error}"),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
