// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage and execution-state collaborator traits.
//!
//! The replicator never owns durable history. It drives a [`HistoryStore`]
//! (branches of events plus the per-run [`VersionHistories`]) and notifies an
//! [`ExecutionState`] when the current branch moves and mutable state has to be
//! rebuilt.
//!
//! # Example
//!
//! ```rust,no_run
//! use history_replicator::storage::{BoxFuture, ExecutionState};
//! use history_replicator::history::{HistoryEvent, WorkflowIdentity};
//!
//! struct MyEngine;
//!
//! impl ExecutionState for MyEngine {
//!     fn truncate_and_replay<'a>(
//!         &'a self,
//!         _identity: &'a WorkflowIdentity,
//!         _from_event_id: i64,
//!         _events: &'a [HistoryEvent],
//!     ) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

pub mod memory;

pub use memory::InMemoryHistoryStore;

use crate::error::Result;
use crate::history::{BranchToken, HistoryBatch, HistoryEvent, VersionHistories, WorkflowIdentity};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable history storage.
///
/// Writes are position-addressed: appending events starting at `n` replaces
/// anything already stored at `n` and beyond on that branch. A partially
/// applied task is therefore overwritten when it is redelivered.
///
/// Failures should be reported as
/// [`ReplicationError::TransientStorage`](crate::error::ReplicationError::TransientStorage)
/// so the task is retried.
pub trait HistoryStore: Send + Sync + 'static {
    /// Allocate an empty branch for a run's first history.
    fn new_branch<'a>(&'a self, identity: &'a WorkflowIdentity) -> BoxFuture<'a, BranchToken>;

    /// Write events to a branch. The first event must be at most one past the
    /// branch's current end.
    fn append_history_events<'a>(
        &'a self,
        token: &'a BranchToken,
        events: &'a [HistoryBatch],
    ) -> BoxFuture<'a, ()>;

    /// Create a branch sharing `token`'s events up to and including
    /// `fork_event_id`.
    fn fork_history<'a>(
        &'a self,
        token: &'a BranchToken,
        fork_event_id: i64,
    ) -> BoxFuture<'a, BranchToken>;

    /// Read events `from..=to` of a branch (clamped to what exists).
    fn read_history_events<'a>(
        &'a self,
        token: &'a BranchToken,
        from_event_id: i64,
        to_event_id: i64,
    ) -> BoxFuture<'a, Vec<HistoryEvent>>;

    /// Version histories of a run, `None` if the run is unknown.
    fn load_version_histories<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
    ) -> BoxFuture<'a, Option<VersionHistories>>;

    /// Persist version histories. This is the commit point of a task.
    fn save_version_histories<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
        histories: &'a VersionHistories,
    ) -> BoxFuture<'a, ()>;
}

/// Workflow execution state owned by the execution engine.
pub trait ExecutionState: Send + Sync + 'static {
    /// Discard state derived from events at or after `from_event_id` and
    /// replay `events` (the new current branch from that point).
    ///
    /// Must be idempotent: it may run again for the same branch after a crash.
    fn truncate_and_replay<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
        from_event_id: i64,
        events: &'a [HistoryEvent],
    ) -> BoxFuture<'a, ()>;
}

/// A no-op implementation for standalone mode and tests.
///
/// Logs rebuild requests but doesn't keep any state.
#[derive(Clone, Default)]
pub struct NoOpExecutionState;

impl ExecutionState for NoOpExecutionState {
    fn truncate_and_replay<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
        from_event_id: i64,
        events: &'a [HistoryEvent],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(
                workflow = %identity,
                from_event_id,
                events = events.len(),
                "NoOp: would rebuild execution state"
            );
            Ok(())
        })
    }
}
