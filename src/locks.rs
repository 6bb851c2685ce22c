//! Per-run lock table.
//!
//! At most one task per workflow run is applied at a time. Locks are created on
//! first use and dropped when the last holder or waiter lets go, so the table
//! only ever holds runs with work in flight.

use crate::history::WorkflowIdentity;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes, one per [`WorkflowIdentity`].
#[derive(Default)]
pub struct RunLockTable {
    locks: DashMap<WorkflowIdentity, Arc<Mutex<()>>>,
}

impl RunLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a run.
    pub async fn acquire(&self, identity: &WorkflowIdentity) -> RunLockGuard<'_> {
        // Clone the Arc under the shard lock so a concurrent release cannot
        // remove the entry between lookup and lock.
        let mutex = Arc::clone(&self.locks.entry(identity.clone()).or_default());
        let guard = mutex.lock_owned().await;
        RunLockGuard {
            table: self,
            identity: identity.clone(),
            guard: Some(guard),
        }
    }

    /// Runs currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn release(&self, identity: &WorkflowIdentity) {
        // Only the table's own reference left: nobody holds or waits.
        self.locks
            .remove_if(identity, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Held while a run is being applied. Dropping it releases the run.
pub struct RunLockGuard<'a> {
    table: &'a RunLockTable,
    identity: WorkflowIdentity,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RunLockGuard<'_> {
    pub fn identity(&self) -> &WorkflowIdentity {
        &self.identity
    }
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        // The owned guard holds a reference to the mutex; drop it first.
        self.guard.take();
        self.table.release(&self.identity);
    }
}
