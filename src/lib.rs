#![forbid(unsafe_code)]

//! `docflow`: orchestration engine for a multi-phase document pipeline.
//!
//! A [`orchestrator::WorkflowCoordinator`] drives each session through a
//! fixed sequence of phases. Inside a phase, tasks form a dependency graph
//! that the scheduler turns into batches of ready work, the dispatcher runs
//! on bounded per-capability agent pools, and the coordinator checkpoints
//! after every batch. Human review gates can pause a session between
//! phases or on individual task outputs.

pub mod agent;
pub mod audit;
pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
