//! In-process task source for embedding and tests.

use super::{codec, ReplicationTaskSource};
use crate::error::{ReplicationError, Result};
use crate::history::{FullHistory, RawReplicationTask, ReplicationTask, WorkflowIdentity};
use crate::storage::BoxFuture;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Per-cluster ordered task logs plus registered backfill histories.
#[derive(Default)]
pub struct InMemoryTaskSource {
    streams: DashMap<String, BTreeMap<i64, RawReplicationTask>>,
    histories: DashMap<(String, WorkflowIdentity), FullHistory>,
}

impl InMemoryTaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode and publish a task on its source cluster's stream.
    pub fn publish(&self, task: &ReplicationTask) -> Result<()> {
        self.publish_raw(codec::to_raw(task, false)?);
        Ok(())
    }

    /// Publish pre-encoded bytes (possibly garbage).
    pub fn publish_raw(&self, raw: RawReplicationTask) {
        self.streams
            .entry(raw.source_cluster.clone())
            .or_default()
            .insert(raw.task_id, raw);
    }

    /// Serve `history` for backfill requests about `identity`.
    pub fn register_history(
        &self,
        source_cluster: impl Into<String>,
        identity: WorkflowIdentity,
        history: FullHistory,
    ) {
        self.histories
            .insert((source_cluster.into(), identity), history);
    }

    /// Number of tasks ever published for a cluster.
    pub fn published(&self, source_cluster: &str) -> usize {
        self.streams.get(source_cluster).map(|s| s.len()).unwrap_or(0)
    }
}

impl ReplicationTaskSource for InMemoryTaskSource {
    fn pull<'a>(
        &'a self,
        source_cluster: &'a str,
        after_task_id: i64,
        max_batch: usize,
    ) -> BoxFuture<'a, Vec<RawReplicationTask>> {
        Box::pin(async move {
            let Some(stream) = self.streams.get(source_cluster) else {
                return Ok(Vec::new());
            };
            let start = after_task_id.saturating_add(1);
            Ok(stream
                .range(start..)
                .take(max_batch)
                .map(|(_, raw)| raw.clone())
                .collect())
        })
    }

    fn fetch_full_history<'a>(
        &'a self,
        source_cluster: &'a str,
        identity: &'a WorkflowIdentity,
    ) -> BoxFuture<'a, FullHistory> {
        Box::pin(async move {
            self.histories
                .get(&(source_cluster.to_string(), identity.clone()))
                .map(|h| h.clone())
                .ok_or_else(|| {
                    ReplicationError::timeout(
                        "fetch_full_history",
                        format!("{} has no history for {}", source_cluster, identity),
                    )
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pull_is_exclusive_and_bounded() {
        let source = InMemoryTaskSource::new();
        for id in 1..=5 {
            source.publish_raw(RawReplicationTask::new("active", id, vec![]));
        }

        let tasks = source.pull("active", 2, 2).await.unwrap();
        let ids: Vec<i64> = tasks.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![3, 4]);

        assert!(source.pull("active", 5, 10).await.unwrap().is_empty());
        assert!(source.pull("unknown", -1, 10).await.unwrap().is_empty());
        assert_eq!(source.pull("active", -1, 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_missing_history_is_retryable() {
        let source = InMemoryTaskSource::new();
        let id = WorkflowIdentity::new("d", "w", "r");
        let err = source.fetch_full_history("active", &id).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
