//! Task graph scheduling: readiness, phase completion, plan validation.
//!
//! All functions are pure over a [`WorkflowSession`] snapshot, so the same
//! snapshot always yields the same answers in the same order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::models::phase::Phase;
use crate::models::session::WorkflowSession;
use crate::models::task::{Task, TaskStatus};
use crate::{AppError, Result};

/// Tasks eligible for dispatch right now.
///
/// A task is ready when it is pending and every prerequisite is completed.
/// Ordered by phase order, then descending priority, then task id. An empty
/// result means "nothing runnable now", not an error.
#[must_use]
pub fn ready_tasks(session: &WorkflowSession) -> Vec<&Task> {
    let mut ready: Vec<&Task> = session
        .tasks
        .values()
        .filter(|task| task.status == TaskStatus::Pending)
        .filter(|task| {
            task.prerequisites.iter().all(|prereq| {
                session
                    .task(prereq)
                    .is_some_and(|upstream| upstream.status == TaskStatus::Completed)
            })
        })
        .collect();

    ready.sort_by(|a, b| {
        (a.phase, Reverse(a.priority), &a.id).cmp(&(b.phase, Reverse(b.priority), &b.id))
    });
    ready
}

/// Whether every task of `phase` is completed. A phase without tasks is
/// vacuously complete.
#[must_use]
pub fn is_phase_complete(session: &WorkflowSession, phase: Phase) -> bool {
    session
        .tasks_in_phase(phase)
        .all(|task| task.status == TaskStatus::Completed)
}

/// Successor of `phase` in the fixed pipeline, `None` at the terminal phase.
#[must_use]
pub fn next_phase(phase: Phase) -> Option<Phase> {
    phase.next()
}

/// Ids of tasks that failed for good, sorted.
#[must_use]
pub fn failed_tasks(session: &WorkflowSession) -> Vec<String> {
    session
        .tasks
        .values()
        .filter(|task| task.status == TaskStatus::Failed)
        .map(|task| task.id.clone())
        .collect()
}

/// Pending tasks that can never become ready because an upstream task
/// (direct or transitive) failed or was cancelled. Sorted by id.
#[must_use]
pub fn blocked_tasks(session: &WorkflowSession) -> Vec<String> {
    let mut queue: VecDeque<&str> = session
        .tasks
        .values()
        .filter(|task| matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled))
        .map(|task| task.id.as_str())
        .collect();

    let mut visited: HashSet<&str> = queue.iter().copied().collect();
    let mut blocked = BTreeSet::new();

    while let Some(id) = queue.pop_front() {
        let Some(task) = session.task(id) else {
            continue;
        };
        for dependent in &task.unblocks {
            if !visited.insert(dependent.as_str()) {
                continue;
            }
            if let Some(downstream) = session.task(dependent) {
                if downstream.status == TaskStatus::Pending {
                    blocked.insert(downstream.id.clone());
                }
                queue.push_back(downstream.id.as_str());
            }
        }
    }

    blocked.into_iter().collect()
}

/// Ids of `phase` tasks whose output awaits human approval, sorted.
#[must_use]
pub fn tasks_awaiting_review(session: &WorkflowSession, phase: Phase) -> Vec<String> {
    session
        .tasks_in_phase(phase)
        .filter(|task| task.status == TaskStatus::AwaitingReview)
        .map(|task| task.id.clone())
        .collect()
}

/// Validate a generated plan against the session's existing task arena.
///
/// # Errors
///
/// Returns `AppError::Plan` for an empty id or capability, a duplicate id,
/// a prerequisite that exists neither in the plan nor in the session, or a
/// dependency cycle.
pub fn validate_plan(session: &WorkflowSession, plan: &[Task]) -> Result<()> {
    let mut plan_ids: HashSet<&str> = HashSet::with_capacity(plan.len());
    for task in plan {
        if task.id.trim().is_empty() {
            return Err(AppError::Plan("task id must not be empty".into()));
        }
        if task.capability.trim().is_empty() {
            return Err(AppError::Plan(format!(
                "task {} has no target capability",
                task.id
            )));
        }
        if session.tasks.contains_key(&task.id) || !plan_ids.insert(task.id.as_str()) {
            return Err(AppError::Plan(format!("duplicate task id: {}", task.id)));
        }
    }

    for task in plan {
        if let Some(missing) = task.prerequisites.iter().find(|prereq| {
            !plan_ids.contains(prereq.as_str()) && !session.tasks.contains_key(prereq.as_str())
        }) {
            return Err(AppError::Plan(format!(
                "task {} depends on unknown task {missing}",
                task.id
            )));
        }
    }

    // Kahn's algorithm over edges internal to the plan; edges into the
    // existing arena cannot close a cycle.
    let mut indegree: HashMap<&str, usize> = plan.iter().map(|t| (t.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in plan {
        for prereq in &task.prerequisites {
            if plan_ids.contains(prereq.as_str()) {
                *indegree.entry(task.id.as_str()).or_default() += 1;
                dependents
                    .entry(prereq.as_str())
                    .or_default()
                    .push(task.id.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if visited != plan.len() {
        let mut cyclic: Vec<&str> = indegree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id)
            .collect();
        cyclic.sort_unstable();
        return Err(AppError::Plan(format!(
            "dependency cycle among tasks: {}",
            cyclic.join(", ")
        )));
    }

    Ok(())
}
