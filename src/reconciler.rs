//! Version history reconciliation.
//!
//! Classifies an incoming history fragment against the branches already stored
//! for a run. The result is a closed set of outcomes so the applier is a plain
//! dispatch:
//!
//! ```text
//!                 ┌─────────────── local branches empty ───────────────┐
//!                 │                                                    │
//!          events start at 1?                                          │
//!            yes → Create                                              │
//!            no  → NeedsBackfill                                       │
//!                                                                      │
//!  otherwise, in order:                                                │
//!    some branch contains incoming          → Duplicate                │
//!    some branch is a prefix of incoming    → Extend (that branch)     │
//!    some branch shares a prefix (LCA)      → Fork (at the LCA)        │
//!    nothing connects                       → Unresolvable             │
//! ```
//!
//! Gaps between the local branch and the first incoming event surface as
//! [`ReplicationError::MissingPredecessorHistory`] so the caller can backfill.
//!
//! Classification is pure. Persisting the outcome happens in the applier, which
//! then calls [`commit_extend`], [`commit_fork`] or [`commit_create`] to compute
//! the new [`VersionHistories`] and whether execution state must be rebuilt.

use crate::error::{ReplicationError, Result};
use crate::history::version_history::validate_items;
use crate::history::{
    find_lowest_common_ancestor, HistoryBatch, VersionHistories, VersionHistory,
    VersionHistoryItem, WorkflowIdentity,
};

/// Outcome of classifying an incoming history against local branches.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// First history for this run: create the initial branch.
    Create {
        history: VersionHistory,
        events: Vec<HistoryBatch>,
    },

    /// Every incoming event is already recorded on `branch_index`.
    Duplicate { branch_index: usize },

    /// Append `events` to `branch_index`; its history becomes `history`.
    Extend {
        branch_index: usize,
        history: VersionHistory,
        events: Vec<HistoryBatch>,
    },

    /// Copy `base_index` up to `lca` into a new branch and append `events`.
    Fork {
        base_index: usize,
        lca: VersionHistoryItem,
        history: VersionHistory,
        events: Vec<HistoryBatch>,
    },

    /// No local history and the task does not start the run.
    NeedsBackfill,

    /// The incoming history contradicts itself or shares no root with any
    /// local branch.
    Unresolvable { reason: String },
}

impl Reconciliation {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Duplicate { .. } => "duplicate",
            Self::Extend { .. } => "extend",
            Self::Fork { .. } => "fork",
            Self::NeedsBackfill => "needs_backfill",
            Self::Unresolvable { .. } => "unresolvable",
        }
    }

    /// Whether applying this outcome writes to storage.
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Self::Create { .. } | Self::Extend { .. } | Self::Fork { .. }
        )
    }
}

/// Where execution state must be rebuilt from after the current branch moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildPoint {
    /// Index of the new current branch.
    pub branch_index: usize,
    /// First event that differs from the previously current branch.
    pub from_event_id: i64,
}

/// Version histories after a mutation, ready to be saved.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchUpdate {
    pub histories: VersionHistories,
    /// Branch that received the events.
    pub branch_index: usize,
    /// Set when the current branch changed and execution state is stale.
    pub rebuild: Option<RebuildPoint>,
}

/// Classify an incoming history and its tail events.
pub fn reconcile(
    identity: &WorkflowIdentity,
    existing: Option<&VersionHistories>,
    incoming: &VersionHistory,
    events: &[HistoryBatch],
) -> Result<Reconciliation> {
    if let Err(reason) = validate_incoming(incoming, events) {
        return Ok(Reconciliation::Unresolvable { reason });
    }

    let first_event_id = events[0].first_event_id();

    let histories = match existing {
        Some(h) if !h.is_empty() => h,
        _ => {
            if first_event_id == 1 {
                return Ok(Reconciliation::Create {
                    history: incoming.clone(),
                    events: events.to_vec(),
                });
            }
            return Ok(Reconciliation::NeedsBackfill);
        }
    };

    if let Some(branch_index) = histories.find_containing(incoming) {
        return Ok(Reconciliation::Duplicate { branch_index });
    }

    if let Some(branch_index) = histories.find_extendable(incoming) {
        let branch = histories.get(branch_index)?;
        let branch_last = branch.last_event_id();
        if first_event_id - 1 > branch_last {
            return Err(ReplicationError::MissingPredecessorHistory {
                workflow_id: identity.workflow_id.clone(),
                local_last_event_id: branch_last,
                incoming_first_event_id: first_event_id,
            });
        }
        return Ok(Reconciliation::Extend {
            branch_index,
            history: incoming.with_branch_token(branch.branch_token.clone()),
            events: trim_events(events, branch_last),
        });
    }

    let Some((base_index, lca)) = histories.find_best_lca(incoming) else {
        return Ok(Reconciliation::Unresolvable {
            reason: format!(
                "incoming history ending at event {} shares no root with {} local branch(es)",
                incoming.last_event_id(),
                histories.len()
            ),
        });
    };

    if first_event_id - 1 > lca.last_event_id {
        return Err(ReplicationError::MissingPredecessorHistory {
            workflow_id: identity.workflow_id.clone(),
            local_last_event_id: lca.last_event_id,
            incoming_first_event_id: first_event_id,
        });
    }

    Ok(Reconciliation::Fork {
        base_index,
        lca,
        history: incoming.clone(),
        events: trim_events(events, lca.last_event_id),
    })
}

/// Check the task is self-consistent: well-formed batches, contiguous across
/// batches, every event stamped with the version its history claims, and the
/// history ending at the last event.
///
/// On success every event ID lies in `1..=MAX_EVENT_ID`.
fn validate_incoming(
    incoming: &VersionHistory,
    events: &[HistoryBatch],
) -> std::result::Result<(), String> {
    if incoming.is_empty() {
        return Err("incoming version history is empty".to_string());
    }
    // Deserialized histories skip the constructor checks.
    validate_items(incoming.items()).map_err(|e| e.to_string())?;
    if events.is_empty() {
        return Err("task carries no events".to_string());
    }

    let mut expected_next: Option<i64> = None;
    for batch in events {
        batch.validate().map_err(|e| e.to_string())?;
        if let Some(next) = expected_next {
            if batch.first_event_id() != next {
                return Err(format!(
                    "batches not contiguous: expected event {}, got {}",
                    next,
                    batch.first_event_id()
                ));
            }
        }
        for event in batch.events() {
            match incoming.version_at(event.event_id) {
                Some(version) if version == event.version => {}
                Some(version) => {
                    return Err(format!(
                        "event {} has version {} but version history says {}",
                        event.event_id, event.version, version
                    ));
                }
                None => {
                    return Err(format!(
                        "event {} lies beyond version history ending at {}",
                        event.event_id,
                        incoming.last_event_id()
                    ));
                }
            }
        }
        expected_next = batch.last_event_id().checked_add(1);
    }

    let last_event_id = events.last().map(|b| b.last_event_id()).unwrap_or(0);
    if last_event_id != incoming.last_event_id() {
        return Err(format!(
            "version history ends at {} but events end at {}",
            incoming.last_event_id(),
            last_event_id
        ));
    }
    Ok(())
}

/// Drop events at or below `after_event_id`, keeping batch boundaries.
fn trim_events(events: &[HistoryBatch], after_event_id: i64) -> Vec<HistoryBatch> {
    events
        .iter()
        .filter_map(|batch| {
            if batch.first_event_id() > after_event_id {
                return Some(batch.clone());
            }
            let tail: Vec<_> = batch
                .events()
                .iter()
                .filter(|e| e.event_id > after_event_id)
                .cloned()
                .collect();
            HistoryBatch::new(tail).ok()
        })
        .collect()
}

/// Compute the rebuild point when the current branch moved from `previous`.
fn rebuild_point(histories: &VersionHistories, previous: usize) -> Option<RebuildPoint> {
    let current = histories.current_index();
    if current == previous {
        return None;
    }
    let from_event_id = histories
        .get(previous)
        .ok()
        .and_then(|old| find_lowest_common_ancestor(old, histories.current()).ok())
        .map(|lca| lca.last_event_id.saturating_add(1))
        .unwrap_or(1);
    Some(RebuildPoint {
        branch_index: current,
        from_event_id,
    })
}

/// Histories after the initial branch was created.
pub fn commit_create(history: VersionHistory) -> BranchUpdate {
    BranchUpdate {
        histories: VersionHistories::new(history),
        branch_index: 0,
        rebuild: None,
    }
}

/// Histories after `branch_index` was extended to `history`.
pub fn commit_extend(
    mut histories: VersionHistories,
    branch_index: usize,
    history: VersionHistory,
) -> Result<BranchUpdate> {
    let previous = histories.current_index();
    histories.update(branch_index, history)?;
    let rebuild = rebuild_point(&histories, previous);
    Ok(BranchUpdate {
        histories,
        branch_index,
        rebuild,
    })
}

/// Histories after a forked branch `history` was inserted.
pub fn commit_fork(mut histories: VersionHistories, history: VersionHistory) -> BranchUpdate {
    let previous = histories.current_index();
    let branch_index = histories.add(history);
    let rebuild = rebuild_point(&histories, previous);
    BranchUpdate {
        histories,
        branch_index,
        rebuild,
    }
}
