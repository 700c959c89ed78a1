//! Workflow orchestration modules.
//!
//! Covers task graph scheduling, agent dispatch, human review, checkpoint
//! creation/restore, and the coordinator that ties them together.

pub mod checkpoint_manager;
pub mod coordinator;
pub mod dispatcher;
pub mod planner;
pub mod review_gate;
pub mod scheduler;

pub use checkpoint_manager::CheckpointManager;
pub use coordinator::{StatusSnapshot, TaskCounts, WorkflowCoordinator, INITIAL_DOCUMENTS_KEY};
pub use dispatcher::{DispatchJob, DispatchResult, Dispatcher, TaskOutcome};
pub use planner::{ConfiguredPlanner, TaskPlanner};
pub use review_gate::ReviewGate;
