//! In-memory [`HistoryStore`].
//!
//! Branches are lists of views into immutable, reference-counted event
//! segments. Forking copies the views up to the fork point, never the events:
//!
//! ```text
//! segments:  S0 [1..=5]        S1 [6..=8]      S2 [6..=7]
//! branch a:  S0[..5] ─────────  S1[..3]
//! branch b:  S0[..5] ─────────  S2[..2]        (forked from a at 5)
//! ```

use super::{BoxFuture, HistoryStore};
use crate::error::{ReplicationError, Result};
use crate::history::{BranchToken, HistoryBatch, HistoryEvent, VersionHistories, WorkflowIdentity};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A prefix of an immutable segment.
#[derive(Debug, Clone)]
struct SegmentView {
    events: Arc<[HistoryEvent]>,
    len: usize,
}

impl SegmentView {
    fn slice(&self) -> &[HistoryEvent] {
        &self.events[..self.len]
    }
}

#[derive(Debug, Clone, Default)]
struct Branch {
    segments: Vec<SegmentView>,
}

impl Branch {
    fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Keep only the first `keep` events.
    fn truncate(&mut self, keep: usize) {
        let mut remaining = keep;
        let mut kept = Vec::with_capacity(self.segments.len());
        for view in self.segments.drain(..) {
            if remaining == 0 {
                break;
            }
            let take = view.len.min(remaining);
            remaining -= take;
            kept.push(SegmentView {
                events: view.events,
                len: take,
            });
        }
        self.segments = kept;
    }

    fn events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.segments.iter().flat_map(|s| s.slice().iter())
    }
}

/// Reference [`HistoryStore`] holding everything in process memory.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    branches: DashMap<BranchToken, Branch>,
    histories: DashMap<WorkflowIdentity, VersionHistories>,
    next_branch: AtomicU64,
    mutations: AtomicU64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of branches ever allocated.
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Number of successful writes (branch, append, fork, save).
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Event count of a branch, if it exists.
    pub fn branch_len(&self, token: &BranchToken) -> Option<usize> {
        self.branches.get(token).map(|b| b.len())
    }

    fn allocate_token(&self) -> BranchToken {
        let n = self.next_branch.fetch_add(1, Ordering::Relaxed);
        BranchToken(n.to_be_bytes().to_vec())
    }

    fn unknown_branch(operation: &str, token: &BranchToken) -> ReplicationError {
        ReplicationError::Internal(format!("{}: unknown branch {}", operation, token))
    }

    fn append(&self, token: &BranchToken, events: &[HistoryBatch]) -> Result<()> {
        let Some(first) = events.first().map(|b| b.first_event_id()) else {
            return Ok(());
        };
        let flat: Vec<HistoryEvent> = events
            .iter()
            .flat_map(|b| b.events().iter().cloned())
            .collect();

        let mut branch = self
            .branches
            .get_mut(token)
            .ok_or_else(|| Self::unknown_branch("append_history_events", token))?;
        let len = branch.len() as i64;
        if first < 1 || first > len + 1 {
            return Err(ReplicationError::Internal(format!(
                "append at event {} leaves a gap after branch end {}",
                first, len
            )));
        }

        branch.truncate((first - 1) as usize);
        let segment: Arc<[HistoryEvent]> = flat.into();
        let view_len = segment.len();
        branch.segments.push(SegmentView {
            events: segment,
            len: view_len,
        });
        Ok(())
    }

    fn fork(&self, token: &BranchToken, fork_event_id: i64) -> Result<BranchToken> {
        let base = self
            .branches
            .get(token)
            .map(|b| b.clone())
            .ok_or_else(|| Self::unknown_branch("fork_history", token))?;
        let len = base.len() as i64;
        if fork_event_id < 0 || fork_event_id > len {
            return Err(ReplicationError::Internal(format!(
                "fork point {} outside branch of {} events",
                fork_event_id, len
            )));
        }

        let mut forked = base;
        forked.truncate(fork_event_id as usize);
        let new_token = self.allocate_token();
        self.branches.insert(new_token.clone(), forked);
        Ok(new_token)
    }

    fn read(&self, token: &BranchToken, from: i64, to: i64) -> Result<Vec<HistoryEvent>> {
        let branch = self
            .branches
            .get(token)
            .ok_or_else(|| Self::unknown_branch("read_history_events", token))?;
        Ok(branch
            .events()
            .filter(|e| e.event_id >= from && e.event_id <= to)
            .cloned()
            .collect())
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn new_branch<'a>(&'a self, identity: &'a WorkflowIdentity) -> BoxFuture<'a, BranchToken> {
        Box::pin(async move {
            let token = self.allocate_token();
            self.branches.insert(token.clone(), Branch::default());
            self.record_mutation();
            tracing::trace!(workflow = %identity, branch = %token, "Allocated branch");
            Ok(token)
        })
    }

    fn append_history_events<'a>(
        &'a self,
        token: &'a BranchToken,
        events: &'a [HistoryBatch],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.append(token, events)?;
            self.record_mutation();
            Ok(())
        })
    }

    fn fork_history<'a>(
        &'a self,
        token: &'a BranchToken,
        fork_event_id: i64,
    ) -> BoxFuture<'a, BranchToken> {
        Box::pin(async move {
            let forked = self.fork(token, fork_event_id)?;
            self.record_mutation();
            Ok(forked)
        })
    }

    fn read_history_events<'a>(
        &'a self,
        token: &'a BranchToken,
        from_event_id: i64,
        to_event_id: i64,
    ) -> BoxFuture<'a, Vec<HistoryEvent>> {
        Box::pin(async move { self.read(token, from_event_id, to_event_id) })
    }

    fn load_version_histories<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
    ) -> BoxFuture<'a, Option<VersionHistories>> {
        Box::pin(async move { Ok(self.histories.get(identity).map(|h| h.clone())) })
    }

    fn save_version_histories<'a>(
        &'a self,
        identity: &'a WorkflowIdentity,
        histories: &'a VersionHistories,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.histories.insert(identity.clone(), histories.clone());
            self.record_mutation();
            Ok(())
        })
    }
}
