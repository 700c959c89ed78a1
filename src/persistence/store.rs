//! Checkpoint storage abstraction.

use std::future::Future;
use std::pin::Pin;

use crate::models::checkpoint::Checkpoint;
use crate::Result;

/// Boxed future returned by [`CheckpointStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable home for session checkpoints.
///
/// Every save is a new record; `load` returns the record with the highest
/// sequence number for the session.
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint.
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> StoreFuture<'a, ()>;

    /// Latest checkpoint of a session, `None` if it never checkpointed.
    fn load<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<Checkpoint>>;

    /// Every checkpoint of a session, oldest first.
    fn history<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Vec<Checkpoint>>;
}
