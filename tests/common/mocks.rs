//! Recording and failure-injecting collaborators.
//!
//! - [`FlakyHistoryStore`]: in-memory store whose operations can be made to
//!   fail a set number of times, or all the time
//! - [`RecordingExecutionState`]: records every rebuild request
//! - [`CountingTaskSource`]: in-memory source counting backfill requests and
//!   failing pulls on demand

use history_replicator::history::{
    BranchToken, FullHistory, HistoryBatch, HistoryEvent, RawReplicationTask, VersionHistories,
    WorkflowIdentity,
};
use history_replicator::storage::BoxFuture;
use history_replicator::{
    ExecutionState, HistoryStore, InMemoryHistoryStore, InMemoryTaskSource, ReplicationError,
    ReplicationTaskSource, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

// =============================================================================
// FlakyHistoryStore
// =============================================================================

/// [`InMemoryHistoryStore`] with injectable failures.
#[derive(Default)]
pub struct FlakyHistoryStore {
    inner: InMemoryHistoryStore,
    /// Operation name -> remaining failures.
    fail_next: Mutex<HashMap<&'static str, usize>>,
    /// Every operation fails while set.
    down: AtomicBool,
    injected: AtomicUsize,
}

impl FlakyHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryHistoryStore {
        &self.inner
    }

    /// Fail the next `times` calls of `operation`.
    pub fn fail_next(&self, operation: &'static str, times: usize) {
        self.fail_next.lock().unwrap().insert(operation, times);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        let fail = self.down.load(Ordering::SeqCst) || {
            let mut fail_next = self.fail_next.lock().unwrap();
            match fail_next.get_mut(operation) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(ReplicationError::storage(operation, "injected failure"));
        }
        Ok(())
    }
}

impl HistoryStore for FlakyHistoryStore {
    fn new_branch<'a>(&'a self, identity: &'a WorkflowIdentity) -> BoxFuture<'a, BranchToken> {
        Box::pin(async move {
            self.check("new_branch")?;
            self.inner.new_branch(identity).await
        })
    }

    fn append_history_events<'a>(
        &'a self,
        token: &'a BranchToken,
        events: &'a [HistoryBatch],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check("append_history_events")?;
            self.inner.append_history_events(token, events).await
        })
    }

    fn fork_history<'a>(
        &'a self,
        token: &'a BranchToken,
        fork_event_id: i64,
    ) -> BoxFuture<'a, BranchToken> {
        Box::pin(async move {
            self.check("fork_history")?;
            self.inner.fork_history(token, fork_event_id).await
        })
    }

    fn read_history_events<'a>(
        &'a self,
        token: &'a BranchToken,
        from_event_id: i64,
        to_event_id: i64,
    ) -> BoxFuture<'a, Vec<HistoryEvent>> {
        Box::pin(async move {
            self.check("read_history_events")?;
            self.inner
                .read_history_events(token, from_event_id, to_event_id)
                .await
        })
    }

    fn load_version_histories<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
    ) -> BoxFuture<'a, Option<VersionHistories>> {
        Box::pin(async move {
            self.check("load_version_histories")?;
            self.inner.load_version_histories(identity).await
        })
    }

    fn save_version_histories<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
        histories: &'a VersionHistories,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check("save_version_histories")?;
            self.inner.save_version_histories(identity, histories).await
        })
    }
}

// =============================================================================
// RecordingExecutionState
// =============================================================================

/// A recorded `truncate_and_replay` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildCall {
    pub identity: WorkflowIdentity,
    pub from_event_id: i64,
    pub event_ids: Vec<i64>,
}

#[derive(Default)]
pub struct RecordingExecutionState {
    calls: Mutex<Vec<RebuildCall>>,
}

impl RecordingExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RebuildCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ExecutionState for RecordingExecutionState {
    fn truncate_and_replay<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
        from_event_id: i64,
        events: &'a [HistoryEvent],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(RebuildCall {
                identity: identity.clone(),
                from_event_id,
                event_ids: events.iter().map(|e| e.event_id).collect(),
            });
            Ok(())
        })
    }
}

// =============================================================================
// CountingTaskSource
// =============================================================================

/// [`InMemoryTaskSource`] that counts backfill requests and can fail pulls.
#[derive(Default)]
pub struct CountingTaskSource {
    inner: InMemoryTaskSource,
    fetch_calls: AtomicUsize,
    failing_pulls: AtomicUsize,
}

impl CountingTaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryTaskSource {
        &self.inner
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `times` pulls with a network timeout.
    pub fn fail_pulls(&self, times: usize) {
        self.failing_pulls.store(times, Ordering::SeqCst);
    }
}

impl ReplicationTaskSource for CountingTaskSource {
    fn pull<'a>(
        &'a self,
        source_cluster: &'a str,
        after_task_id: i64,
        max_batch: usize,
    ) -> BoxFuture<'a, Vec<RawReplicationTask>> {
        Box::pin(async move {
            let failing = self
                .failing_pulls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ReplicationError::timeout("pull", "injected failure"));
            }
            self.inner.pull(source_cluster, after_task_id, max_batch).await
        })
    }

    fn fetch_full_history<'a>(
        &'a self,
        source_cluster: &'a str,
        identity: &'a WorkflowIdentity,
    ) -> BoxFuture<'a, FullHistory> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_full_history(source_cluster, identity).await
        })
    }
}
