//! Task applier: one attempt at applying a replication task.
//!
//! # State Machine
//!
//! ```text
//!   Pending ──► Applying ──┬──► Applied
//!                  ▲       ├──► FailedRetryable   (storage / network, second backfill)
//!                  │       ├──► FailedTerminal    (unresolvable, undecodable)
//!                  │       └──► NeedsBackfill ──► fetch full history ──┐
//!                  └───────────────────────────────────────────────────┘
//! ```
//!
//! An attempt holds the run's lock from the first load to the final save, so
//! two tasks of one run never interleave their writes.
//!
//! # Commit Point
//!
//! Events are appended (and branches forked) before the version histories are
//! saved. Appends are position-addressed, so if the attempt dies before the
//! save the next delivery overwrites the orphaned events. Execution state is
//! rebuilt before the save for the same reason: a failed rebuild leaves the
//! task uncommitted and the whole attempt is redone.
//!
//! Retrying and DLQ handling live one level up, in
//! [`TaskProcessor`](crate::processor::TaskProcessor).

use crate::circuit_breaker::StorageCircuit;
use crate::error::{ReplicationError, Result};
use crate::history::{
    BranchToken, HistoryBatch, ReplicationTask, VersionHistories, VersionHistory, WorkflowIdentity,
};
use crate::locks::RunLockTable;
use crate::metrics;
use crate::reconciler::{
    commit_create, commit_extend, commit_fork, reconcile, BranchUpdate, RebuildPoint,
    Reconciliation,
};
use crate::source::ReplicationTaskSource;
use crate::storage::{ExecutionState, HistoryStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Applying,
    Applied,
    NeedsBackfill,
    FailedRetryable,
    FailedTerminal,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::NeedsBackfill => "needs_backfill",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    /// Final state of an attempt that ended with `result`.
    pub fn for_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Applied,
            Err(e) if e.is_terminal() => Self::FailedTerminal,
            Err(_) => Self::FailedRetryable,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Applied | Self::FailedRetryable | Self::FailedTerminal
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful attempt did.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Reconciliation label of the task itself.
    pub classification: &'static str,
    /// Whether a full-history backfill ran first.
    pub backfilled: bool,
    /// Set when execution state was rebuilt.
    pub rebuild: Option<RebuildPoint>,
    /// Events written to storage (0 for a duplicate).
    pub events_written: usize,
}

/// Result of persisting one reconciliation outcome.
struct Persisted {
    rebuild: Option<RebuildPoint>,
    events_written: usize,
}

/// Applies tasks against a [`HistoryStore`].
pub struct TaskApplier {
    store: Arc<dyn HistoryStore>,
    execution: Arc<dyn ExecutionState>,
    source: Arc<dyn ReplicationTaskSource>,
    locks: RunLockTable,
    circuit: StorageCircuit,
}

impl TaskApplier {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        execution: Arc<dyn ExecutionState>,
        source: Arc<dyn ReplicationTaskSource>,
    ) -> Self {
        Self::with_circuit(store, execution, source, StorageCircuit::new())
    }

    pub fn with_circuit(
        store: Arc<dyn HistoryStore>,
        execution: Arc<dyn ExecutionState>,
        source: Arc<dyn ReplicationTaskSource>,
        circuit: StorageCircuit,
    ) -> Self {
        Self {
            store,
            execution,
            source,
            locks: RunLockTable::new(),
            circuit,
        }
    }

    pub fn circuit(&self) -> &StorageCircuit {
        &self.circuit
    }

    /// Runs currently locked by an attempt.
    pub fn runs_in_flight(&self) -> usize {
        self.locks.len()
    }

    /// Make one attempt at applying `task`.
    ///
    /// At most one backfill runs per attempt. Errors are classified with
    /// [`TaskState::for_result`].
    pub async fn apply(&self, task: &ReplicationTask) -> Result<ApplyOutcome> {
        let start = Instant::now();
        let _guard = self.locks.acquire(&task.identity).await;
        self.transition(task, TaskState::Applying);

        let result = self.apply_locked(task).await;

        let state = TaskState::for_result(&result);
        self.transition(task, state);
        match &result {
            Ok(outcome) => {
                metrics::record_task_applied(&task.source_cluster, start.elapsed());
                debug!(
                    source_cluster = %task.source_cluster,
                    task_id = task.task_id,
                    workflow = %task.identity,
                    classification = outcome.classification,
                    events_written = outcome.events_written,
                    "Task applied"
                );
            }
            Err(e) => {
                metrics::record_error(&task.source_cluster, e.kind());
                debug!(
                    source_cluster = %task.source_cluster,
                    task_id = task.task_id,
                    state = %state,
                    error = %e,
                    "Task attempt failed"
                );
            }
        }
        result
    }

    async fn apply_locked(&self, task: &ReplicationTask) -> Result<ApplyOutcome> {
        let incoming = task.incoming_history()?;
        let mut backfilled = false;

        loop {
            let existing = self.load(&task.identity).await?;
            let classification =
                reconcile(&task.identity, existing.as_ref(), &incoming, &task.events);

            let gap = match &classification {
                Ok(Reconciliation::NeedsBackfill) => true,
                Err(e) => e.needs_backfill(),
                Ok(_) => false,
            };
            if gap {
                if backfilled {
                    // The backfill did not close the gap; let the retry loop
                    // try again later.
                    return Err(match classification {
                        Err(e) => e,
                        Ok(_) => ReplicationError::MissingPredecessorHistory {
                            workflow_id: task.identity.workflow_id.clone(),
                            local_last_event_id: 0,
                            incoming_first_event_id: task.first_event_id(),
                        },
                    });
                }
                self.transition(task, TaskState::NeedsBackfill);
                let result = self.backfill(task, existing).await;
                metrics::record_backfill(&task.source_cluster, result.is_ok());
                result?;
                backfilled = true;
                self.transition(task, TaskState::Applying);
                continue;
            }

            let classification = classification?;
            let label = classification.label();
            metrics::record_classification(label);
            let persisted = self
                .persist(&task.identity, existing, classification)
                .await?;

            return Ok(ApplyOutcome {
                classification: label,
                backfilled,
                rebuild: persisted.rebuild,
                events_written: persisted.events_written,
            });
        }
    }

    /// Fetch the run's full history from its source and persist it.
    async fn backfill(
        &self,
        task: &ReplicationTask,
        existing: Option<VersionHistories>,
    ) -> Result<()> {
        info!(
            source_cluster = %task.source_cluster,
            task_id = task.task_id,
            workflow = %task.identity,
            "Backfilling full history"
        );
        let full = self
            .source
            .fetch_full_history(&task.source_cluster, &task.identity)
            .await?;
        let incoming = VersionHistory::new(BranchToken::default(), full.version_history)?;
        let classification = reconcile(&task.identity, existing.as_ref(), &incoming, &full.events)?;
        if matches!(classification, Reconciliation::NeedsBackfill) {
            return Err(ReplicationError::MissingPredecessorHistory {
                workflow_id: task.identity.workflow_id.clone(),
                local_last_event_id: 0,
                incoming_first_event_id: full.events.first().map(|b| b.first_event_id()).unwrap_or(0),
            });
        }
        let persisted = self.persist(&task.identity, existing, classification).await?;
        debug!(
            workflow = %task.identity,
            events_written = persisted.events_written,
            "Backfill persisted"
        );
        Ok(())
    }

    /// Write a reconciliation outcome: events first, then rebuild, then the
    /// version histories.
    async fn persist(
        &self,
        identity: &WorkflowIdentity,
        existing: Option<VersionHistories>,
        classification: Reconciliation,
    ) -> Result<Persisted> {
        let (update, events_written) = match classification {
            Reconciliation::Duplicate { branch_index } => {
                debug!(workflow = %identity, branch_index, "Duplicate task, nothing to write");
                return Ok(Persisted {
                    rebuild: None,
                    events_written: 0,
                });
            }
            Reconciliation::Unresolvable { reason } => {
                return Err(ReplicationError::VersionHistoryUnresolvable(reason));
            }
            Reconciliation::NeedsBackfill => {
                return Err(ReplicationError::Internal(format!(
                    "backfill outcome reached persist for {}",
                    identity
                )));
            }
            Reconciliation::Create { history, events } => {
                let token = self
                    .circuit
                    .write("new_branch", || self.store.new_branch(identity))
                    .await?;
                let written = self.append(&token, &events).await?;
                (commit_create(history.with_branch_token(token)), written)
            }
            Reconciliation::Extend {
                branch_index,
                history,
                events,
            } => {
                let histories = require_existing(identity, existing)?;
                let written = self.append(&history.branch_token, &events).await?;
                (commit_extend(histories, branch_index, history)?, written)
            }
            Reconciliation::Fork {
                base_index,
                lca,
                history,
                events,
            } => {
                let histories = require_existing(identity, existing)?;
                let base_token = histories.get(base_index)?.branch_token.clone();
                let token = self
                    .circuit
                    .write("fork_history", || {
                        self.store.fork_history(&base_token, lca.last_event_id)
                    })
                    .await?;
                info!(
                    workflow = %identity,
                    base_index,
                    fork_event_id = lca.last_event_id,
                    fork_version = lca.version,
                    branch = %token,
                    "Forked branch"
                );
                let written = self.append(&token, &events).await?;
                (commit_fork(histories, history.with_branch_token(token)), written)
            }
        };

        if let Some(point) = update.rebuild {
            self.rebuild(identity, &update, point).await?;
        }

        self.circuit
            .write("save_version_histories", || {
                self.store.save_version_histories(identity, &update.histories)
            })
            .await?;

        Ok(Persisted {
            rebuild: update.rebuild,
            events_written,
        })
    }

    async fn append(&self, token: &BranchToken, events: &[HistoryBatch]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        self.circuit
            .write("append_history_events", || {
                self.store.append_history_events(token, events)
            })
            .await?;
        Ok(events.iter().map(|b| b.len()).sum())
    }

    async fn load(&self, identity: &WorkflowIdentity) -> Result<Option<VersionHistories>> {
        self.circuit
            .read("load_version_histories", || {
                self.store.load_version_histories(identity)
            })
            .await
    }

    /// Replay the new current branch from the divergence point.
    async fn rebuild(
        &self,
        identity: &WorkflowIdentity,
        update: &BranchUpdate,
        point: RebuildPoint,
    ) -> Result<()> {
        let current = update.histories.get(point.branch_index)?;
        let events = self
            .circuit
            .read("read_history_events", || {
                self.store.read_history_events(
                    &current.branch_token,
                    point.from_event_id,
                    current.last_event_id(),
                )
            })
            .await?;

        info!(
            workflow = %identity,
            branch_index = point.branch_index,
            from_event_id = point.from_event_id,
            events = events.len(),
            "Current branch changed, rebuilding execution state"
        );
        self.execution
            .truncate_and_replay(identity, point.from_event_id, &events)
            .await?;
        metrics::record_rebuild(events.len());
        Ok(())
    }

    fn transition(&self, task: &ReplicationTask, state: TaskState) {
        metrics::record_task_state(&task.source_cluster, state.as_str());
        if state == TaskState::FailedTerminal {
            warn!(
                source_cluster = %task.source_cluster,
                task_id = task.task_id,
                workflow = %task.identity,
                state = %state,
                "Task state"
            );
        } else {
            debug!(
                source_cluster = %task.source_cluster,
                task_id = task.task_id,
                workflow = %task.identity,
                state = %state,
                "Task state"
            );
        }
    }
}

fn require_existing(
    identity: &WorkflowIdentity,
    existing: Option<VersionHistories>,
) -> Result<VersionHistories> {
    existing.ok_or_else(|| {
        ReplicationError::Internal(format!("no version histories loaded for {}", identity))
    })
}
