//! SQLite-backed DLQ and retry bookkeeping.
//!
//! Two tables:
//!
//! - `dlq_entries`: tasks that failed terminally, keyed by
//!   (source_cluster, task_id). The raw task bytes are kept as delivered so
//!   undecodable tasks survive for inspection.
//! - `retry_state`: attempt count and first-failure time of tasks currently
//!   being retried, written on every retryable failure so a restart does not
//!   reset the retry budget.

use crate::error::{ReplicationError, Result};
use crate::history::{RawReplicationTask, WorkflowIdentity};
use crate::sqlite::{self, execute_with_retry};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

const STORE: &str = "dlq";

/// A task that could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqEntry {
    pub source_cluster: String,
    pub task_id: i64,
    /// Absent when the payload could not be decoded.
    pub identity: Option<WorkflowIdentity>,
    pub first_failure_time: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: String,
    pub raw_task: RawReplicationTask,
}

/// One page of a DLQ range read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DlqPage {
    pub entries: Vec<DlqEntry>,
    /// Pass back to continue; `None` when the range is exhausted.
    pub next_page_token: Option<Vec<u8>>,
}

/// Retry bookkeeping of a task still being retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecord {
    pub attempt_count: u32,
    pub first_failure_time: DateTime<Utc>,
    pub last_error: String,
}

/// A (source cluster, run) pair held behind a DLQ entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedPair {
    pub source_cluster: String,
    pub identity: WorkflowIdentity,
    pub task_id: i64,
}

#[derive(sqlx::FromRow)]
struct DlqRow {
    source_cluster: String,
    task_id: i64,
    domain_id: Option<String>,
    workflow_id: Option<String>,
    run_id: Option<String>,
    first_failure_ms: i64,
    attempt_count: i64,
    last_error: String,
    payload: Vec<u8>,
    content_hash: Option<String>,
}

impl DlqRow {
    fn into_entry(self) -> DlqEntry {
        let identity = match (self.domain_id, self.workflow_id, self.run_id) {
            (Some(d), Some(w), Some(r)) => Some(WorkflowIdentity::new(d, w, r)),
            _ => None,
        };
        DlqEntry {
            raw_task: RawReplicationTask {
                source_cluster: self.source_cluster.clone(),
                task_id: self.task_id,
                payload: self.payload,
                content_hash: self.content_hash,
            },
            source_cluster: self.source_cluster,
            task_id: self.task_id,
            identity,
            first_failure_time: from_millis(self.first_failure_ms),
            attempt_count: self.attempt_count.clamp(0, u32::MAX as i64) as u32,
            last_error: self.last_error,
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Encode the last returned task ID as an opaque page token.
fn encode_page_token(task_id: i64) -> Vec<u8> {
    task_id.to_be_bytes().to_vec()
}

fn decode_page_token(token: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = token.try_into().map_err(|_| {
        ReplicationError::Config(format!("invalid DLQ page token ({} bytes)", token.len()))
    })?;
    Ok(i64::from_be_bytes(bytes))
}

/// Persistent DLQ backed by SQLite.
pub struct DlqStore {
    pool: SqlitePool,
    path: String,
}

impl DlqStore {
    /// Open (or create) a DLQ store.
    pub async fn new(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, "Initializing DLQ store");
        let pool = sqlite::open_pool(path, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dlq_entries (
                source_cluster TEXT NOT NULL,
                task_id INTEGER NOT NULL,
                domain_id TEXT,
                workflow_id TEXT,
                run_id TEXT,
                first_failure_ms INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                payload BLOB NOT NULL,
                content_hash TEXT,
                PRIMARY KEY (source_cluster, task_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_state (
                source_cluster TEXT NOT NULL,
                task_id INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL,
                first_failure_ms INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                PRIMARY KEY (source_cluster, task_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dlq_entries")
            .fetch_one(&pool)
            .await?;
        if count > 0 {
            warn!(count, "DLQ holds entries from a previous run");
        }

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// Insert an entry. Returns `false` if (source, task_id) was already there.
    pub async fn put(&self, entry: &DlqEntry) -> Result<bool> {
        let pool = &self.pool;
        let (domain_id, workflow_id, run_id) = match &entry.identity {
            Some(id) => (
                Some(id.domain_id.as_str()),
                Some(id.workflow_id.as_str()),
                Some(id.run_id.as_str()),
            ),
            None => (None, None, None),
        };

        let result = execute_with_retry(STORE, "put", || async {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO dlq_entries (
                    source_cluster, task_id, domain_id, workflow_id, run_id,
                    first_failure_ms, attempt_count, last_error, payload, content_hash
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.source_cluster)
            .bind(entry.task_id)
            .bind(domain_id)
            .bind(workflow_id)
            .bind(run_id)
            .bind(entry.first_failure_time.timestamp_millis())
            .bind(entry.attempt_count as i64)
            .bind(&entry.last_error)
            .bind(&entry.raw_task.payload)
            .bind(entry.raw_task.content_hash.as_deref())
            .execute(pool)
            .await
        })
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!(
            source_cluster = %entry.source_cluster,
            task_id = entry.task_id,
            inserted,
            "DLQ put"
        );
        Ok(inserted)
    }

    /// Entries of `source_cluster` with `from_exclusive < task_id <= to_inclusive`,
    /// ascending, `page_size` at a time.
    pub async fn range(
        &self,
        source_cluster: &str,
        from_exclusive: i64,
        to_inclusive: i64,
        page_size: i64,
        page_token: Option<&[u8]>,
    ) -> Result<DlqPage> {
        if page_size < 1 {
            return Err(ReplicationError::Config(format!(
                "DLQ page size must be positive, got {}",
                page_size
            )));
        }
        let after = match page_token {
            Some(token) => decode_page_token(token)?.max(from_exclusive),
            None => from_exclusive,
        };
        // One extra row tells whether another page exists.
        let limit = page_size.saturating_add(1);

        let pool = &self.pool;
        let rows: Vec<DlqRow> = execute_with_retry(STORE, "range", || async {
            sqlx::query_as::<_, DlqRow>(
                r#"
                SELECT source_cluster, task_id, domain_id, workflow_id, run_id,
                       first_failure_ms, attempt_count, last_error, payload, content_hash
                FROM dlq_entries
                WHERE source_cluster = ? AND task_id > ? AND task_id <= ?
                ORDER BY task_id ASC
                LIMIT ?
                "#,
            )
            .bind(source_cluster)
            .bind(after)
            .bind(to_inclusive)
            .bind(limit)
            .fetch_all(pool)
            .await
        })
        .await?;

        let has_more = rows.len() as i64 > page_size;
        let mut entries: Vec<DlqEntry> = rows.into_iter().map(DlqRow::into_entry).collect();
        if has_more {
            entries.truncate(page_size as usize);
        }
        let next_page_token = if has_more {
            entries.last().map(|e| encode_page_token(e.task_id))
        } else {
            None
        };

        Ok(DlqPage {
            entries,
            next_page_token,
        })
    }

    pub async fn get(&self, source_cluster: &str, task_id: i64) -> Result<Option<DlqEntry>> {
        let pool = &self.pool;
        let row: Option<DlqRow> = execute_with_retry(STORE, "get", || async {
            sqlx::query_as::<_, DlqRow>(
                r#"
                SELECT source_cluster, task_id, domain_id, workflow_id, run_id,
                       first_failure_ms, attempt_count, last_error, payload, content_hash
                FROM dlq_entries
                WHERE source_cluster = ? AND task_id = ?
                "#,
            )
            .bind(source_cluster)
            .bind(task_id)
            .fetch_optional(pool)
            .await
        })
        .await?;
        Ok(row.map(DlqRow::into_entry))
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn delete(&self, source_cluster: &str, task_id: i64) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry(STORE, "delete", || async {
            sqlx::query("DELETE FROM dlq_entries WHERE source_cluster = ? AND task_id = ?")
                .bind(source_cluster)
                .bind(task_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record another failed re-drive of an entry.
    pub async fn bump_attempt(&self, source_cluster: &str, task_id: i64, error: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry(STORE, "bump_attempt", || async {
            sqlx::query(
                r#"
                UPDATE dlq_entries
                SET attempt_count = attempt_count + 1, last_error = ?
                WHERE source_cluster = ? AND task_id = ?
                "#,
            )
            .bind(error)
            .bind(source_cluster)
            .bind(task_id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn count(&self, source_cluster: &str) -> Result<u64> {
        let pool = &self.pool;
        let (count,): (i64,) = execute_with_retry(STORE, "count", || async {
            sqlx::query_as("SELECT COUNT(*) FROM dlq_entries WHERE source_cluster = ?")
                .bind(source_cluster)
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Every DLQ entry that holds a run, in task order per source. Entries
    /// without an identity block nothing.
    pub async fn blocked_pairs(&self) -> Result<Vec<BlockedPair>> {
        let pool = &self.pool;
        let rows: Vec<(String, String, String, String, i64)> =
            execute_with_retry(STORE, "blocked_pairs", || async {
                sqlx::query_as(
                    r#"
                    SELECT source_cluster, domain_id, workflow_id, run_id, task_id
                    FROM dlq_entries
                    WHERE domain_id IS NOT NULL AND workflow_id IS NOT NULL AND run_id IS NOT NULL
                    ORDER BY source_cluster, task_id
                    "#,
                )
                .fetch_all(pool)
                .await
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(source_cluster, d, w, r, task_id)| BlockedPair {
                source_cluster,
                identity: WorkflowIdentity::new(d, w, r),
                task_id,
            })
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Retry bookkeeping
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a retryable failure. The first failure time is kept from the
    /// first record.
    pub async fn record_retry(
        &self,
        source_cluster: &str,
        task_id: i64,
        attempt_count: u32,
        first_failure_time: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry(STORE, "record_retry", || async {
            sqlx::query(
                r#"
                INSERT INTO retry_state (source_cluster, task_id, attempt_count, first_failure_ms, last_error)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source_cluster, task_id) DO UPDATE SET
                    attempt_count = excluded.attempt_count,
                    last_error = excluded.last_error
                "#,
            )
            .bind(source_cluster)
            .bind(task_id)
            .bind(attempt_count as i64)
            .bind(first_failure_time.timestamp_millis())
            .bind(error)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn retry_state(&self, source_cluster: &str, task_id: i64) -> Result<Option<RetryRecord>> {
        let pool = &self.pool;
        let row: Option<(i64, i64, String)> = execute_with_retry(STORE, "retry_state", || async {
            sqlx::query_as(
                r#"
                SELECT attempt_count, first_failure_ms, last_error
                FROM retry_state
                WHERE source_cluster = ? AND task_id = ?
                "#,
            )
            .bind(source_cluster)
            .bind(task_id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        Ok(row.map(|(attempts, first_ms, last_error)| RetryRecord {
            attempt_count: attempts.clamp(0, u32::MAX as i64) as u32,
            first_failure_time: from_millis(first_ms),
            last_error,
        }))
    }

    pub async fn clear_retry(&self, source_cluster: &str, task_id: i64) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry(STORE, "clear_retry", || async {
            sqlx::query("DELETE FROM retry_state WHERE source_cluster = ? AND task_id = ?")
                .bind(source_cluster)
                .bind(task_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if self.path != sqlite::IN_MEMORY {
            if let Err(e) = sqlite::checkpoint(&self.pool, STORE).await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!("DLQ store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, task_id: i64, run: Option<&str>) -> DlqEntry {
        DlqEntry {
            source_cluster: source.to_string(),
            task_id,
            identity: run.map(|r| WorkflowIdentity::new("d", "w", r)),
            first_failure_time: from_millis(1_700_000_000_000),
            attempt_count: 1,
            last_error: "unresolvable".to_string(),
            raw_task: RawReplicationTask::new(source, task_id, b"{}".to_vec()),
        }
    }

    async fn store() -> DlqStore {
        DlqStore::new(sqlite::IN_MEMORY, false).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dlq = store().await;
        let e = entry("active", 5, Some("r"));

        assert!(dlq.put(&e).await.unwrap());
        assert!(!dlq.put(&e).await.unwrap(), "duplicate put is a no-op");
        assert_eq!(dlq.get("active", 5).await.unwrap(), Some(e));
        assert_eq!(dlq.count("active").await.unwrap(), 1);

        assert!(dlq.delete("active", 5).await.unwrap());
        assert!(!dlq.delete("active", 5).await.unwrap());
        assert_eq!(dlq.count("active").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_entry_keeps_raw_bytes() {
        let dlq = store().await;
        let mut e = entry("active", 1, None);
        e.raw_task.payload = vec![0xff, 0x00, 0x13];
        e.raw_task.content_hash = Some("ab".to_string());
        dlq.put(&e).await.unwrap();

        let back = dlq.get("active", 1).await.unwrap().unwrap();
        assert!(back.identity.is_none());
        assert_eq!(back.raw_task, e.raw_task);
        assert!(dlq.blocked_pairs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_pages_and_bounds() {
        let dlq = store().await;
        for id in 1..=5 {
            dlq.put(&entry("active", id, Some("r"))).await.unwrap();
        }
        dlq.put(&entry("standby", 3, Some("r"))).await.unwrap();

        let first = dlq.range("active", -1, i64::MAX, 2, None).await.unwrap();
        let ids: Vec<i64> = first.entries.iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec![1, 2]);
        let token = first.next_page_token.unwrap();

        let second = dlq.range("active", -1, i64::MAX, 2, Some(&token)).await.unwrap();
        let ids: Vec<i64> = second.entries.iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec![3, 4]);

        let third = dlq
            .range("active", -1, i64::MAX, 2, second.next_page_token.as_deref())
            .await
            .unwrap();
        assert_eq!(third.entries.len(), 1);
        assert!(third.next_page_token.is_none());

        let bounded = dlq.range("active", 1, 3, 10, None).await.unwrap();
        let ids: Vec<i64> = bounded.entries.iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_range_with_unbounded_page_size() {
        let dlq = store().await;
        dlq.put(&entry("standby", 1, Some("r"))).await.unwrap();
        let page = dlq.range("standby", -1, i64::MAX, i64::MAX, None).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_range_rejects_bad_input() {
        let dlq = store().await;
        assert!(dlq.range("active", -1, 10, 0, None).await.is_err());
        assert!(dlq.range("active", -1, 10, 5, Some(&[1, 2])).await.is_err());
    }

    #[tokio::test]
    async fn test_blocked_pairs_in_task_order() {
        let dlq = store().await;
        dlq.put(&entry("active", 7, Some("r1"))).await.unwrap();
        dlq.put(&entry("active", 4, Some("r1"))).await.unwrap();
        dlq.put(&entry("active", 5, Some("r2"))).await.unwrap();

        let pairs = dlq.blocked_pairs().await.unwrap();
        let held: Vec<(i64, &str)> = pairs
            .iter()
            .map(|p| (p.task_id, p.identity.run_id.as_str()))
            .collect();
        assert_eq!(held, vec![(4, "r1"), (5, "r2"), (7, "r1")]);
    }

    #[tokio::test]
    async fn test_bump_attempt() {
        let dlq = store().await;
        dlq.put(&entry("active", 2, Some("r"))).await.unwrap();
        dlq.bump_attempt("active", 2, "still broken").await.unwrap();

        let e = dlq.get("active", 2).await.unwrap().unwrap();
        assert_eq!(e.attempt_count, 2);
        assert_eq!(e.last_error, "still broken");
    }

    #[tokio::test]
    async fn test_retry_state_keeps_first_failure() {
        let dlq = store().await;
        let t0 = from_millis(1_000);
        let t1 = from_millis(2_000);

        assert!(dlq.retry_state("active", 9).await.unwrap().is_none());
        dlq.record_retry("active", 9, 1, t0, "timeout").await.unwrap();
        dlq.record_retry("active", 9, 2, t1, "busy").await.unwrap();

        let record = dlq.retry_state("active", 9).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.first_failure_time, t0);
        assert_eq!(record.last_error, "busy");

        dlq.clear_retry("active", 9).await.unwrap();
        assert!(dlq.retry_state("active", 9).await.unwrap().is_none());
    }

    #[test]
    fn test_page_token_round_trip() {
        assert_eq!(decode_page_token(&encode_page_token(-1)).unwrap(), -1);
        assert_eq!(decode_page_token(&encode_page_token(42)).unwrap(), 42);
    }
}
