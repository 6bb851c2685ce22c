//! Administrative DLQ operations: read, write, delete, merge (re-drive) and
//! purge.
//!
//! Merging pages through a task-ID range and gives each entry one more
//! attempt. Reads and merges called with a page size of 0 use the manager's
//! configured page size. An entry that now applies is deleted and, if it was the task
//! blocking its run, the run's parked tasks are drained in arrival order.

use super::store::{DlqEntry, DlqPage, DlqStore};
use crate::error::Result;
use crate::metrics;
use crate::processor::TaskProcessor;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one merge call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Entries applied and removed.
    pub applied: usize,
    /// Entries that failed again and stay in the DLQ.
    pub unresolved: usize,
    /// Continue the merge from here; `None` when the range is done.
    pub next_page_token: Option<Vec<u8>>,
}

/// Page size used when a caller passes 0.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// DLQ read/write/admin surface.
pub struct DlqManager {
    processor: Arc<TaskProcessor>,
    page_size: i64,
}

impl DlqManager {
    pub fn new(processor: Arc<TaskProcessor>) -> Self {
        Self::with_page_size(processor, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(processor: Arc<TaskProcessor>, page_size: i64) -> Self {
        Self {
            processor,
            page_size: if page_size > 0 { page_size } else { DEFAULT_PAGE_SIZE },
        }
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    fn store(&self) -> &DlqStore {
        self.processor.dlq()
    }

    fn resolve_page_size(&self, page_size: i64) -> i64 {
        if page_size == 0 {
            self.page_size
        } else {
            page_size
        }
    }

    /// Entries of `source_cluster` with `last_task_id < task_id <= max_task_id`.
    /// `last_task_id = -1` reads from the beginning.
    pub async fn get_replication_tasks_from_dlq(
        &self,
        source_cluster: &str,
        last_task_id: i64,
        max_task_id: i64,
        page_size: i64,
        page_token: Option<&[u8]>,
    ) -> Result<DlqPage> {
        let page_size = self.resolve_page_size(page_size);
        self.store()
            .range(source_cluster, last_task_id, max_task_id, page_size, page_token)
            .await
    }

    /// Store an entry and block its run. Returns `false` if it was already
    /// there.
    pub async fn put_replication_task_to_dlq(&self, entry: DlqEntry) -> Result<bool> {
        self.processor.dead_letter(entry).await
    }

    /// Remove an entry without re-driving it. The run stays blocked; use
    /// [`purge`](Self::purge) to release it.
    pub async fn delete_replication_task_from_dlq(
        &self,
        source_cluster: &str,
        task_id: i64,
    ) -> Result<bool> {
        let deleted = self.store().delete(source_cluster, task_id).await?;
        if deleted {
            metrics::record_dlq_delete(source_cluster, 1);
            info!(source_cluster = %source_cluster, task_id, "Deleted DLQ entry");
        }
        Ok(deleted)
    }

    /// Re-drive one page of entries in `last_task_id < task_id <= max_task_id`.
    pub async fn merge_replication_tasks(
        &self,
        source_cluster: &str,
        last_task_id: i64,
        max_task_id: i64,
        page_size: i64,
        page_token: Option<&[u8]>,
    ) -> Result<MergeReport> {
        let page_size = self.resolve_page_size(page_size);
        let page = self
            .store()
            .range(source_cluster, last_task_id, max_task_id, page_size, page_token)
            .await?;

        let mut report = MergeReport {
            next_page_token: page.next_page_token,
            ..Default::default()
        };

        for entry in page.entries {
            match self.processor.redrive(&entry).await {
                Ok(outcome) => {
                    self.store().delete(source_cluster, entry.task_id).await?;
                    report.applied += 1;
                    info!(
                        source_cluster = %source_cluster,
                        task_id = entry.task_id,
                        classification = outcome.classification,
                        "DLQ entry merged"
                    );
                    self.release(&entry).await?;
                }
                Err(e) => {
                    report.unresolved += 1;
                    warn!(
                        source_cluster = %source_cluster,
                        task_id = entry.task_id,
                        error = %e,
                        "DLQ entry still fails"
                    );
                    self.store()
                        .bump_attempt(source_cluster, entry.task_id, &e.to_string())
                        .await?;
                }
            }
        }

        metrics::record_dlq_merge(source_cluster, report.applied, report.unresolved);
        if report.applied > 0 {
            metrics::record_dlq_delete(source_cluster, report.applied);
        }
        Ok(report)
    }

    /// Delete an entry and release its run's parked tasks.
    pub async fn purge(&self, source_cluster: &str, task_id: i64) -> Result<bool> {
        let Some(entry) = self.store().get(source_cluster, task_id).await? else {
            return Ok(false);
        };
        self.delete_replication_task_from_dlq(source_cluster, task_id)
            .await?;
        warn!(
            source_cluster = %source_cluster,
            task_id,
            "Purged DLQ entry without applying it"
        );
        self.release(&entry).await?;
        Ok(true)
    }

    /// Drain the entry's run if the entry is what blocks it.
    async fn release(&self, entry: &DlqEntry) -> Result<()> {
        let Some(identity) = &entry.identity else {
            return Ok(());
        };
        let progress = self.processor.progress();
        if progress.blocked_by(&entry.source_cluster, identity) != Some(entry.task_id) {
            return Ok(());
        }
        let drained = self
            .processor
            .drain_parked(&entry.source_cluster, identity)
            .await?;
        info!(
            source_cluster = %entry.source_cluster,
            workflow = %identity,
            drained,
            "Released blocked run"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::TaskApplier;
    use crate::history::{
        HistoryBatch, HistoryEvent, RawReplicationTask, ReplicationTask, VersionHistoryItem,
        WorkflowIdentity,
    };
    use crate::processor::Disposition;
    use crate::progress::ProgressTracker;
    use crate::resilience::RetryConfig;
    use crate::source::{codec, InMemoryTaskSource};
    use crate::sqlite;
    use crate::storage::{InMemoryHistoryStore, NoOpExecutionState};
    use tokio::sync::watch;

    fn task(task_id: i64, from: i64, to: i64, item_version: i64) -> ReplicationTask {
        let events = HistoryBatch::new(
            (from..=to)
                .map(|id| HistoryEvent {
                    event_id: id,
                    event_type: "Test".to_string(),
                    version: 1,
                    payload: serde_json::Value::Null,
                    timestamp: 0,
                })
                .collect(),
        )
        .unwrap();
        ReplicationTask {
            source_cluster: "active".to_string(),
            task_id,
            identity: WorkflowIdentity::new("d", "w", "r"),
            version_history: vec![VersionHistoryItem::new(to, item_version)],
            events: vec![events],
        }
    }

    async fn manager() -> (DlqManager, Arc<TaskProcessor>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let applier = TaskApplier::new(
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(NoOpExecutionState),
            Arc::new(InMemoryTaskSource::new()),
        );
        let dlq = Arc::new(DlqStore::new(sqlite::IN_MEMORY, false).await.unwrap());
        let progress = Arc::new(ProgressTracker::new());
        progress.init_source("active", 0);
        let processor = Arc::new(TaskProcessor::new(
            applier,
            progress,
            dlq,
            RetryConfig::testing(),
            rx,
        ));
        (DlqManager::new(processor.clone()), processor, tx)
    }

    async fn submit(p: &TaskProcessor, t: &ReplicationTask) -> Disposition {
        p.progress().register(&t.source_cluster, t.task_id);
        p.process(codec::to_raw(t, false).unwrap()).await.unwrap()
    }

    fn entry_for(t: &ReplicationTask) -> DlqEntry {
        DlqEntry {
            source_cluster: t.source_cluster.clone(),
            task_id: t.task_id,
            identity: Some(t.identity.clone()),
            first_failure_time: chrono::Utc::now(),
            attempt_count: 1,
            last_error: "operator".to_string(),
            raw_task: codec::to_raw(t, false).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_put_read_delete_round_trip() {
        let (m, _, _tx) = manager().await;
        let t = task(4, 1, 2, 1);

        assert!(m.put_replication_task_to_dlq(entry_for(&t)).await.unwrap());
        let page = m
            .get_replication_tasks_from_dlq("active", -1, i64::MAX, i64::MAX, None)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].task_id, 4);

        assert!(m.delete_replication_task_from_dlq("active", 4).await.unwrap());
        let page = m
            .get_replication_tasks_from_dlq("active", -1, i64::MAX, i64::MAX, None)
            .await
            .unwrap();
        assert!(page.entries.is_empty());
    }

    #[tokio::test]
    async fn test_zero_page_size_uses_configured_default() {
        let (_, p, _tx) = manager().await;
        let m = DlqManager::with_page_size(p.clone(), 2);
        assert_eq!(m.page_size(), 2);
        for id in 1..=3 {
            let mut t = task(id, 1, 2, 1);
            t.identity = WorkflowIdentity::new("d", "w", format!("r{}", id));
            m.put_replication_task_to_dlq(entry_for(&t)).await.unwrap();
        }

        let page = m
            .get_replication_tasks_from_dlq("active", -1, i64::MAX, 0, None)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(page.next_page_token.is_some());

        let report = m
            .merge_replication_tasks("active", -1, i64::MAX, 0, None)
            .await
            .unwrap();
        assert_eq!(report.applied, 2);
        assert!(report.next_page_token.is_some());

        // An explicit size still wins, and a bad one is still rejected.
        let page = m
            .get_replication_tasks_from_dlq("active", -1, i64::MAX, 10, None)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(m
            .get_replication_tasks_from_dlq("active", -1, i64::MAX, -1, None)
            .await
            .is_err());
        assert_eq!(DlqManager::with_page_size(p, 0).page_size(), DEFAULT_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_merge_applies_and_drains_parked() {
        let (m, p, _tx) = manager().await;
        let first = task(1, 1, 3, 1);
        let second = task(2, 4, 5, 1);

        // Operator parks the first task, the second queues behind it.
        m.put_replication_task_to_dlq(entry_for(&first)).await.unwrap();
        assert_eq!(submit(&p, &second).await, Disposition::Parked);

        let report = m
            .merge_replication_tasks("active", -1, i64::MAX, 10, None)
            .await
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.unresolved, 0);
        assert!(report.next_page_token.is_none());

        let id = first.identity.clone();
        assert_eq!(p.progress().blocked_by("active", &id), None);
        assert_eq!(p.progress().watermark("active", &id), Some(2));
        assert_eq!(p.dlq().count("active").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_merge_leaves_failing_entry() {
        let (m, p, _tx) = manager().await;
        p.progress().register("active", 1);
        let raw = RawReplicationTask::new("active", 1, b"garbage".to_vec());
        assert_eq!(p.process(raw).await.unwrap(), Disposition::DeadLettered);

        let report = m
            .merge_replication_tasks("active", -1, i64::MAX, 10, None)
            .await
            .unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.unresolved, 1);

        let entry = p.dlq().get("active", 1).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_purge_releases_run() {
        let (m, p, _tx) = manager().await;
        // Version history disagrees with its events: terminal.
        let bad = task(1, 1, 3, 7);
        assert_eq!(submit(&p, &bad).await, Disposition::DeadLettered);
        assert_eq!(submit(&p, &task(2, 1, 3, 1)).await, Disposition::Parked);

        assert!(m.purge("active", 1).await.unwrap());
        assert!(!m.purge("active", 1).await.unwrap());

        let id = bad.identity.clone();
        assert_eq!(p.progress().blocked_by("active", &id), None);
        assert_eq!(p.progress().watermark("active", &id), Some(2));
        assert_eq!(p.progress().ack_level("active"), Some(2));
    }
}
