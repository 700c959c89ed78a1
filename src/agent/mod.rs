//! Agent capability interface consumed by the dispatcher.
//!
//! Agents are opaque executors: they receive a task input plus a context
//! snapshot and return an output payload, optionally declaring updates to
//! the session's global context. Implementations are registered per
//! capability name in an [`AgentRegistry`].

pub mod registry;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use crate::models::session::Context;

pub use registry::{AgentPool, AgentRegistry, AgentRegistryBuilder};

/// Successful agent result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    /// Output payload stored on the task.
    pub output: serde_json::Value,
    /// Keys merged into the session's global context after the batch.
    pub context_updates: Context,
}

impl AgentOutput {
    /// Output without context updates.
    #[must_use]
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            context_updates: Context::new(),
        }
    }

    /// Declare a context update.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

/// Failure reported by an agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// No healthy instance could take the task; requeued without using retry budget.
    Unavailable(String),
    /// The task itself failed; consumes retry budget.
    Execution(String),
}

impl Display for AgentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "agent unavailable: {msg}"),
            Self::Execution(msg) => write!(f, "agent execution: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<AgentError> for crate::AppError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Unavailable(msg) => Self::AgentUnavailable(msg),
            AgentError::Execution(msg) => Self::AgentExecution(msg),
        }
    }
}

/// Boxed future returned by [`Agent::execute`].
pub type AgentFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<AgentOutput, AgentError>> + Send + 'a>>;

/// A pluggable executor for one capability (e.g., "drafting", "research").
pub trait Agent: Send + Sync {
    /// Execute a task.
    ///
    /// `context` is the session's global context merged with the outputs of
    /// the task's completed prerequisites, keyed by prerequisite task id.
    fn execute(&self, input: serde_json::Value, context: Context) -> AgentFuture<'_>;

    /// Whether the agent can currently accept work.
    ///
    /// Tasks for an unavailable capability are requeued, not failed.
    fn is_available(&self) -> bool {
        true
    }
}
