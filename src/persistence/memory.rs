//! In-process checkpoint store.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::models::checkpoint::Checkpoint;

use super::store::{CheckpointStore, StoreFuture};

/// Keeps checkpoints in memory; lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints held for a session.
    #[must_use]
    pub fn count(&self, session_id: &str) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or(0, Vec::len)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(checkpoint.session_id.clone())
                .or_default()
                .push(checkpoint.clone());
            Ok(())
        })
    }

    fn load<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<Checkpoint>> {
        Box::pin(async move {
            Ok(self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(session_id)
                .and_then(|records| records.iter().max_by_key(|cp| cp.sequence))
                .cloned())
        })
    }

    fn history<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Vec<Checkpoint>> {
        Box::pin(async move {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(session_id)
                .cloned()
                .unwrap_or_default();
            records.sort_by_key(|cp| cp.sequence);
            Ok(records)
        })
    }
}
