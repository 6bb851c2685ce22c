//! Replication progress: per-run watermarks, the blocked-run gate, and
//! per-source ack levels.
//!
//! # Ordering gate
//!
//! When a task of run R from source S fails terminally, (S, R) is blocked:
//! later tasks of that pair are parked in arrival order instead of applied.
//! Releasing the gate hands the parked tasks back one at a time and only
//! removes the block once none are left, so nothing overtakes them. A second
//! DLQ entry of the same pair queues with the parked tasks and takes over the
//! block when the drain reaches it.
//!
//! ```text
//!   task ──► blocked? ──no──► apply ──► advance watermark ──► finish(task_id)
//!               │
//!              yes ──► park (ack level stays pinned below it)
//! ```
//!
//! # Ack level
//!
//! Per source, the highest task ID at or below which every pulled task is
//! finished. It is what the cursor store persists, so a restart redelivers
//! exactly the tasks that might not have been handled.

use crate::history::{ReplicationTask, WorkflowIdentity};
use crate::metrics;
use dashmap::DashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

/// (source cluster, run) key.
pub type PairKey = (String, WorkflowIdentity);

pub fn pair_key(source_cluster: &str, identity: &WorkflowIdentity) -> PairKey {
    (source_cluster.to_string(), identity.clone())
}

/// Something waiting behind a blocked pair.
#[derive(Debug)]
enum Waiting {
    Task(ReplicationTask),
    /// A later DLQ entry of the pair. The drain stops here and it becomes
    /// the blocker.
    DeadLettered(i64),
}

/// A blocked pair and what is waiting behind it, in arrival order.
#[derive(Debug)]
struct Gate {
    blocked_by: i64,
    parked: VecDeque<Waiting>,
}

impl Gate {
    fn parked_tasks(&self) -> usize {
        self.parked
            .iter()
            .filter(|w| matches!(w, Waiting::Task(_)))
            .count()
    }

    /// Whether `task_id` is a DLQ entry queued behind the blocker.
    fn holds_entry(&self, task_id: i64) -> bool {
        self.parked
            .iter()
            .any(|w| matches!(w, Waiting::DeadLettered(id) if *id == task_id))
    }
}

#[derive(Debug, Default)]
struct AckState {
    ack_level: i64,
    highest_registered: i64,
    outstanding: BTreeSet<i64>,
}

impl AckState {
    fn recompute(&mut self) -> i64 {
        self.ack_level = match self.outstanding.first() {
            Some(&lowest) => lowest - 1,
            None => self.highest_registered,
        };
        self.ack_level
    }
}

/// Outcome of offering a task to the gate.
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// Not blocked: apply it.
    Proceed(ReplicationTask),
    /// The task is the one already sitting in the DLQ for this pair.
    AlreadyInDlq,
    /// Parked behind a blocked pair.
    Parked,
}

/// Shared progress state for one engine.
#[derive(Default)]
pub struct ProgressTracker {
    watermarks: DashMap<PairKey, i64>,
    gates: DashMap<PairKey, Gate>,
    acks: DashMap<String, Mutex<AckState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Watermarks
    // ═══════════════════════════════════════════════════════════════════════

    /// Highest task ID applied for a pair.
    pub fn watermark(&self, source_cluster: &str, identity: &WorkflowIdentity) -> Option<i64> {
        self.watermarks
            .get(&pair_key(source_cluster, identity))
            .map(|w| *w)
    }

    /// Whether `task_id` is at or below the pair's watermark.
    pub fn is_applied(&self, source_cluster: &str, identity: &WorkflowIdentity, task_id: i64) -> bool {
        self.watermark(source_cluster, identity)
            .is_some_and(|w| task_id <= w)
    }

    /// Raise the pair's watermark. Never moves backwards.
    pub fn advance_watermark(&self, source_cluster: &str, identity: &WorkflowIdentity, task_id: i64) {
        self.watermarks
            .entry(pair_key(source_cluster, identity))
            .and_modify(|w| *w = (*w).max(task_id))
            .or_insert(task_id);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ordering gate
    // ═══════════════════════════════════════════════════════════════════════

    /// Let a task through, or park it behind a blocked pair.
    ///
    /// Tasks older than the blocking entry were pulled before it and go
    /// through.
    pub fn admit(&self, task: ReplicationTask) -> Admission {
        let key = pair_key(&task.source_cluster, &task.identity);
        let Some(mut gate) = self.gates.get_mut(&key) else {
            return Admission::Proceed(task);
        };
        if gate.blocked_by == task.task_id || gate.holds_entry(task.task_id) {
            return Admission::AlreadyInDlq;
        }
        if task.task_id < gate.blocked_by {
            return Admission::Proceed(task);
        }
        let source = task.source_cluster.clone();
        gate.parked.push_back(Waiting::Task(task));
        drop(gate);
        metrics::set_parked_tasks(&source, self.parked_count(&source));
        Admission::Parked
    }

    /// Block a pair behind the DLQ entry `task_id`. Parked tasks are kept.
    pub fn block(&self, source_cluster: &str, identity: &WorkflowIdentity, task_id: i64) {
        self.gates
            .entry(pair_key(source_cluster, identity))
            .and_modify(|g| g.blocked_by = task_id)
            .or_insert_with(|| Gate {
                blocked_by: task_id,
                parked: VecDeque::new(),
            });
        metrics::set_dlq_alarm(source_cluster, self.blocked_count(source_cluster));
    }

    /// Record a DLQ entry of a pair that may already be blocked. Returns
    /// false if the entry was already held.
    ///
    /// The lowest entry blocks the pair. A later one waits in the parked
    /// queue, so draining stops there instead of letting the tasks behind it
    /// overtake it.
    pub fn add_blocker(&self, source_cluster: &str, identity: &WorkflowIdentity, task_id: i64) -> bool {
        let mut added = false;
        let mut gate = self
            .gates
            .entry(pair_key(source_cluster, identity))
            .or_insert_with(|| {
                added = true;
                Gate {
                    blocked_by: task_id,
                    parked: VecDeque::new(),
                }
            });
        if task_id > gate.blocked_by && !gate.holds_entry(task_id) {
            gate.parked.push_back(Waiting::DeadLettered(task_id));
            added = true;
        } else if task_id < gate.blocked_by {
            let previous = std::mem::replace(&mut gate.blocked_by, task_id);
            gate.parked.push_front(Waiting::DeadLettered(previous));
            added = true;
        }
        drop(gate);
        metrics::set_dlq_alarm(source_cluster, self.blocked_count(source_cluster));
        added
    }

    /// Drop the block held by `task_id` after its DLQ write was given up.
    ///
    /// Parked tasks are discarded with the gate. They stay outstanding, so
    /// the ack level keeps them for redelivery.
    pub fn unblock(&self, source_cluster: &str, identity: &WorkflowIdentity, task_id: i64) {
        let key = pair_key(source_cluster, identity);
        if self
            .gates
            .remove_if(&key, |_, g| g.blocked_by == task_id)
            .is_none()
        {
            if let Some(mut gate) = self.gates.get_mut(&key) {
                gate.parked
                    .retain(|w| !matches!(w, Waiting::DeadLettered(id) if *id == task_id));
            }
        }
        metrics::set_dlq_alarm(source_cluster, self.blocked_count(source_cluster));
        metrics::set_parked_tasks(source_cluster, self.parked_count(source_cluster));
    }

    /// DLQ task blocking a pair, if any.
    pub fn blocked_by(&self, source_cluster: &str, identity: &WorkflowIdentity) -> Option<i64> {
        self.gates
            .get(&pair_key(source_cluster, identity))
            .map(|g| g.blocked_by)
    }

    /// Next parked task of a pair.
    ///
    /// `None` once nothing is left (the block is removed) or once a later
    /// DLQ entry is reached (it becomes the blocker). The pair stays blocked
    /// while tasks are handed out, so new arrivals keep queueing behind them.
    pub fn release_next(&self, source_cluster: &str, identity: &WorkflowIdentity) -> Option<ReplicationTask> {
        let key = pair_key(source_cluster, identity);
        loop {
            let next = {
                let mut gate = self.gates.get_mut(&key)?;
                match gate.parked.pop_front() {
                    Some(Waiting::DeadLettered(task_id)) => {
                        gate.blocked_by = task_id;
                        return None;
                    }
                    Some(Waiting::Task(task)) => Some(task),
                    None => None,
                }
            };
            if next.is_some() {
                metrics::set_parked_tasks(source_cluster, self.parked_count(source_cluster));
                return next;
            }
            // A task parked between the pop and the removal keeps the gate.
            if self
                .gates
                .remove_if(&key, |_, g| g.parked.is_empty())
                .is_some()
            {
                metrics::set_dlq_alarm(source_cluster, self.blocked_count(source_cluster));
                metrics::set_parked_tasks(source_cluster, self.parked_count(source_cluster));
                return None;
            }
        }
    }

    /// Blocked pairs of a source.
    pub fn blocked_count(&self, source_cluster: &str) -> usize {
        self.gates
            .iter()
            .filter(|entry| entry.key().0 == source_cluster)
            .count()
    }

    /// Parked tasks of a source.
    pub fn parked_count(&self, source_cluster: &str) -> usize {
        self.gates
            .iter()
            .filter(|entry| entry.key().0 == source_cluster)
            .map(|entry| entry.parked_tasks())
            .sum()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ack levels
    // ═══════════════════════════════════════════════════════════════════════

    /// Start tracking a source from a persisted ack level.
    pub fn init_source(&self, source_cluster: &str, ack_level: i64) {
        self.acks.insert(
            source_cluster.to_string(),
            Mutex::new(AckState {
                ack_level,
                highest_registered: ack_level,
                outstanding: BTreeSet::new(),
            }),
        );
        metrics::set_ack_level(source_cluster, ack_level);
    }

    /// A pulled task was handed to a worker.
    pub fn register(&self, source_cluster: &str, task_id: i64) {
        let entry = self
            .acks
            .entry(source_cluster.to_string())
            .or_insert_with(|| {
                Mutex::new(AckState {
                    ack_level: task_id - 1,
                    highest_registered: task_id - 1,
                    outstanding: BTreeSet::new(),
                })
            });
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
        if task_id > state.ack_level {
            state.outstanding.insert(task_id);
            state.highest_registered = state.highest_registered.max(task_id);
        }
    }

    /// A task is done (applied, skipped or in the DLQ). Returns the new ack
    /// level if it moved.
    pub fn finish(&self, source_cluster: &str, task_id: i64) -> Option<i64> {
        let entry = self.acks.get(source_cluster)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
        if !state.outstanding.remove(&task_id) {
            return None;
        }
        let before = state.ack_level;
        let after = state.recompute();
        if after != before {
            metrics::set_ack_level(source_cluster, after);
            Some(after)
        } else {
            None
        }
    }

    pub fn ack_level(&self, source_cluster: &str) -> Option<i64> {
        self.acks
            .get(source_cluster)
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).ack_level)
    }

    /// Tasks registered but not finished.
    pub fn outstanding(&self, source_cluster: &str) -> usize {
        self.acks
            .get(source_cluster)
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).outstanding.len())
            .unwrap_or(0)
    }
}
