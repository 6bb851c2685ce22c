//! Core history data types.
//!
//! These are the values that travel between clusters inside replication tasks
//! and that the history store persists. Only the replication envelope is
//! interpreted here; event payloads are opaque JSON.

use crate::error::{ReplicationError, Result};
use crate::history::version_history::{VersionHistory, VersionHistoryItem, MAX_EVENT_ID};
use serde::{Deserialize, Serialize};

/// Immutable key identifying one workflow execution instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowIdentity {
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl WorkflowIdentity {
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl std::fmt::Display for WorkflowIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}

/// Opaque handle to a persisted branch, issued by the history store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchToken(pub Vec<u8>);

impl BranchToken {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for BranchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// One history event. `event_id` is branch-local and starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub event_type: String,
    /// Failover version of the cluster that wrote this event.
    pub version: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// Events written by one append. Non-empty and contiguous in `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryBatch {
    events: Vec<HistoryEvent>,
}

impl HistoryBatch {
    /// Build a batch, checking it is non-empty and contiguous.
    pub fn new(events: Vec<HistoryEvent>) -> Result<Self> {
        let batch = Self { events };
        batch.validate()?;
        Ok(batch)
    }

    /// Re-check the batch invariants (deserialization bypasses `new`).
    pub fn validate(&self) -> Result<()> {
        let first = self.events.first().ok_or_else(|| {
            ReplicationError::VersionHistoryUnresolvable("empty history batch".to_string())
        })?;
        if first.event_id < 1 || self.last_event_id() > MAX_EVENT_ID {
            return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                "event ids {}..{} out of range",
                first.event_id,
                self.last_event_id()
            )));
        }
        for pair in self.events.windows(2) {
            if pair[0].event_id.checked_add(1) != Some(pair[1].event_id) {
                return Err(ReplicationError::VersionHistoryUnresolvable(format!(
                    "batch not contiguous: {} followed by {}",
                    pair[0].event_id, pair[1].event_id
                )));
            }
        }
        Ok(())
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut [HistoryEvent] {
        &mut self.events
    }

    pub fn into_events(self) -> Vec<HistoryEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// First event ID (0 for an invalid empty batch).
    pub fn first_event_id(&self) -> i64 {
        self.events.first().map(|e| e.event_id).unwrap_or(0)
    }

    /// Last event ID (0 for an invalid empty batch).
    pub fn last_event_id(&self) -> i64 {
        self.events.last().map(|e| e.event_id).unwrap_or(0)
    }
}

/// A unit of replication: the incoming version history of one run plus the
/// event batches at its tail.
///
/// `task_id` orders tasks per source cluster and is never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub source_cluster: String,
    pub task_id: i64,
    #[serde(flatten)]
    pub identity: WorkflowIdentity,
    pub version_history: Vec<VersionHistoryItem>,
    pub events: Vec<HistoryBatch>,
}

impl ReplicationTask {
    /// The incoming version history (not yet bound to a local branch).
    pub fn incoming_history(&self) -> Result<VersionHistory> {
        VersionHistory::new(BranchToken::default(), self.version_history.clone())
    }

    /// All events of all batches, in order.
    pub fn all_events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.events.iter().flat_map(|b| b.events().iter())
    }

    pub fn first_event_id(&self) -> i64 {
        self.events.first().map(|b| b.first_event_id()).unwrap_or(0)
    }

    pub fn last_event_id(&self) -> i64 {
        self.events.last().map(|b| b.last_event_id()).unwrap_or(0)
    }

    pub fn event_count(&self) -> usize {
        self.events.iter().map(|b| b.len()).sum()
    }
}

/// A task as delivered by the transport, before decoding.
///
/// The DLQ keeps these raw bytes so a task that cannot be decoded is still
/// preserved for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReplicationTask {
    pub source_cluster: String,
    pub task_id: i64,
    /// JSON envelope, optionally zstd-compressed.
    pub payload: Vec<u8>,
    /// SHA-256 (hex) of the decompressed payload, when the transport sent one.
    pub content_hash: Option<String>,
}

impl RawReplicationTask {
    pub fn new(source_cluster: impl Into<String>, task_id: i64, payload: Vec<u8>) -> Self {
        Self {
            source_cluster: source_cluster.into(),
            task_id,
            payload,
            content_hash: None,
        }
    }
}

/// Complete history of a run as served by its source cluster for backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullHistory {
    pub version_history: Vec<VersionHistoryItem>,
    pub events: Vec<HistoryBatch>,
}
