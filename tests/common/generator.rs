//! Deterministic workflow history generator.
//!
//! Produces replication tasks for one run the way an active cluster would:
//! contiguous event IDs, every event stamped with the failover version in
//! effect, and a version history that tracks the events written so far.

use history_replicator::{
    FullHistory, HistoryBatch, HistoryEvent, ReplicationTask, VersionHistoryItem,
    WorkflowIdentity,
};
use serde_json::json;

const EVENT_TYPES: &[&str] = &[
    "DecisionTaskScheduled",
    "DecisionTaskStarted",
    "DecisionTaskCompleted",
    "ActivityTaskScheduled",
    "ActivityTaskStarted",
    "ActivityTaskCompleted",
    "TimerStarted",
    "TimerFired",
];

/// Generates the history of one run on one source cluster.
#[derive(Debug, Clone)]
pub struct HistoryGenerator {
    source_cluster: String,
    identity: WorkflowIdentity,
    version: i64,
    events: Vec<HistoryEvent>,
    items: Vec<VersionHistoryItem>,
    next_task_id: i64,
}

impl HistoryGenerator {
    pub fn new(source_cluster: &str, identity: WorkflowIdentity, version: i64) -> Self {
        Self {
            source_cluster: source_cluster.to_string(),
            identity,
            version,
            events: Vec::new(),
            items: Vec::new(),
            next_task_id: 1,
        }
    }

    /// Generator for run `run_id` of workflow "wf" in domain "domain".
    pub fn for_run(source_cluster: &str, run_id: &str, version: i64) -> Self {
        Self::new(
            source_cluster,
            WorkflowIdentity::new("domain", "wf", run_id),
            version,
        )
    }

    pub fn identity(&self) -> &WorkflowIdentity {
        &self.identity
    }

    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn last_event_id(&self) -> i64 {
        self.events.last().map(|e| e.event_id).unwrap_or(0)
    }

    /// Task ID the next generated task will carry.
    pub fn with_next_task_id(mut self, task_id: i64) -> Self {
        self.next_task_id = task_id;
        self
    }

    /// Subsequent events are written by a cluster with `version`.
    pub fn failover(&mut self, version: i64) {
        self.version = version;
    }

    /// Append `event_count` events as one batch and return the task carrying
    /// them.
    pub fn next_task(&mut self, event_count: usize) -> ReplicationTask {
        self.next_task_batches(&[event_count])
    }

    /// Append one batch per entry of `batch_sizes` and return a single task
    /// carrying all of them.
    pub fn next_task_batches(&mut self, batch_sizes: &[usize]) -> ReplicationTask {
        let mut batches = Vec::with_capacity(batch_sizes.len());
        for &size in batch_sizes {
            let events: Vec<HistoryEvent> = (0..size.max(1)).map(|_| self.push_event()).collect();
            batches.push(HistoryBatch::new(events).expect("generated batch is contiguous"));
        }

        let task = ReplicationTask {
            source_cluster: self.source_cluster.clone(),
            task_id: self.next_task_id,
            identity: self.identity.clone(),
            version_history: self.items.clone(),
            events: batches,
        };
        self.next_task_id += 1;
        task
    }

    /// A copy of this run cut back to `event_id`, continuing with `version`.
    ///
    /// Models the branch a newly promoted cluster writes after a failover.
    pub fn fork_at(&self, event_id: i64, version: i64) -> Self {
        let mut fork = Self::new(&self.source_cluster, self.identity.clone(), self.version);
        fork.next_task_id = self.next_task_id;
        for event in self.events.iter().take_while(|e| e.event_id <= event_id) {
            fork.record(event.clone());
        }
        fork.version = version;
        fork
    }

    /// The complete history as the source cluster would serve it for backfill.
    pub fn full_history(&self) -> FullHistory {
        FullHistory {
            version_history: self.items.clone(),
            events: vec![HistoryBatch::new(self.events.clone()).expect("history is contiguous")],
        }
    }

    fn push_event(&mut self) -> HistoryEvent {
        let event_id = self.last_event_id() + 1;
        let event_type = if event_id == 1 {
            "WorkflowExecutionStarted"
        } else {
            EVENT_TYPES[(event_id as usize - 2) % EVENT_TYPES.len()]
        };
        let event = HistoryEvent {
            event_id,
            event_type: event_type.to_string(),
            version: self.version,
            payload: json!({ "seq": event_id, "run": self.identity.run_id }),
            timestamp: 1_700_000_000_000 + event_id * 1_000,
        };
        self.record(event.clone());
        event
    }

    fn record(&mut self, event: HistoryEvent) {
        match self.items.last_mut() {
            Some(last) if last.version == event.version => last.last_event_id = event.event_id,
            _ => self
                .items
                .push(VersionHistoryItem::new(event.event_id, event.version)),
        }
        self.events.push(event);
    }
}

/// Event IDs of a slice of events.
pub fn event_ids(events: &[HistoryEvent]) -> Vec<i64> {
    events.iter().map(|e| e.event_id).collect()
}
