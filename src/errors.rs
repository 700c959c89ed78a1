//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Session or checkpoint (de)serialization failure.
    Serialization(String),
    /// A generated task plan is malformed (duplicate ids, cycles, dangling edges).
    Plan(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A session or task status change violates the state machine.
    InvalidTransition(String),
    /// No healthy agent instance serves the requested capability.
    AgentUnavailable(String),
    /// An agent invocation failed while executing a task.
    AgentExecution(String),
    /// Checkpoint could not be written or read back intact.
    CheckpointIo(String),
    /// Review request id is not known to the review gate.
    UnknownReviewRequest(String),
    /// No checkpoint has ever been saved for the session.
    NoCheckpointFound(String),
    /// Internal invariant violation.
    Internal(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::Plan(msg) => write!(f, "plan: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::AgentUnavailable(msg) => write!(f, "agent unavailable: {msg}"),
            Self::AgentExecution(msg) => write!(f, "agent execution: {msg}"),
            Self::CheckpointIo(msg) => write!(f, "checkpoint io: {msg}"),
            Self::UnknownReviewRequest(msg) => write!(f, "unknown review request: {msg}"),
            Self::NoCheckpointFound(msg) => write!(f, "no checkpoint found: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
