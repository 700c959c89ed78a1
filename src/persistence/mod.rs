//! Persistence layer modules.

pub mod checkpoint_repo;
pub mod db;
pub mod memory;
pub mod retention;
pub mod schema;
pub mod store;

pub use checkpoint_repo::SqliteCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use store::{CheckpointStore, StoreFuture};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
