// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ack level persistence.
//!
//! Stores, per source cluster, the highest task ID at or below which every
//! pulled task is finished (see [`ProgressTracker`](crate::progress::ProgressTracker)).
//! On restart pulling resumes after it.
//!
//! # Debounced Writes
//!
//! `set()` only touches memory and marks the source dirty. The engine calls
//! `flush_dirty()` every `flush_interval` and on shutdown. A crash in between
//! re-pulls at most one interval of tasks, and those reconcile as duplicates:
//!
//! ```text
//! pull 41..50 → all finished → ack level 50 → flush
//!                               (crash here = re-pull 41..50, idempotent)
//! ```
//!
//! Ack levels only move forward. A lower value than the one held is ignored.

use crate::error::{ReplicationError, Result};
use crate::sqlite::{self, execute_with_retry};
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const STORE: &str = "cursor";

/// Ack level meaning "nothing acknowledged yet".
pub const START: i64 = -1;

#[derive(Debug, Clone, Copy)]
struct AckLevel {
    level: i64,
    /// Not yet written to disk.
    dirty: bool,
}

/// Persistent ack level storage backed by SQLite.
pub struct CursorStore {
    pool: SqlitePool,
    levels: RwLock<HashMap<String, AckLevel>>,
    path: String,
}

impl CursorStore {
    /// Open (or create) a cursor store and load every saved ack level.
    pub async fn new(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, "Initializing cursor store");
        let pool = sqlite::open_pool(path, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ack_levels (
                source_cluster TEXT PRIMARY KEY,
                ack_level INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT source_cluster, ack_level FROM ack_levels")
                .fetch_all(&pool)
                .await?;

        let levels: HashMap<String, AckLevel> = rows
            .into_iter()
            .map(|(source_cluster, level)| {
                debug!(source_cluster = %source_cluster, ack_level = level, "Loaded ack level");
                (source_cluster, AckLevel { level, dirty: false })
            })
            .collect();
        if !levels.is_empty() {
            info!(count = levels.len(), "Restored ack levels from previous run");
        }

        Ok(Self {
            pool,
            levels: RwLock::new(levels),
            path: path.to_string(),
        })
    }

    pub async fn get(&self, source_cluster: &str) -> Option<i64> {
        self.levels.read().await.get(source_cluster).map(|a| a.level)
    }

    /// Ack level, or [`START`] for a source never seen.
    pub async fn get_or_start(&self, source_cluster: &str) -> i64 {
        self.get(source_cluster).await.unwrap_or(START)
    }

    /// Raise the ack level (debounced). Returns false if `ack_level` is
    /// below the one already held.
    pub async fn set(&self, source_cluster: &str, ack_level: i64) -> bool {
        let mut levels = self.levels.write().await;
        match levels.get_mut(source_cluster) {
            Some(current) if ack_level < current.level => {
                warn!(
                    source_cluster = %source_cluster,
                    held = current.level,
                    ack_level,
                    "Ignoring ack level regression"
                );
                return false;
            }
            Some(current) => {
                if current.level != ack_level {
                    current.level = ack_level;
                    current.dirty = true;
                }
            }
            None => {
                levels.insert(
                    source_cluster.to_string(),
                    AckLevel {
                        level: ack_level,
                        dirty: true,
                    },
                );
            }
        }
        debug!(source_cluster = %source_cluster, ack_level, "Ack level updated (pending flush)");
        true
    }

    /// Write every dirty ack level. Returns the number written.
    ///
    /// A source whose write fails stays dirty for the next flush.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let pending: Vec<(String, i64)> = self
            .levels
            .read()
            .await
            .iter()
            .filter(|(_, a)| a.dirty)
            .map(|(source, a)| (source.clone(), a.level))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let mut flushed = 0;
        let mut errors = 0;

        for (source_cluster, ack_level) in &pending {
            let result = execute_with_retry(STORE, "flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO ack_levels (source_cluster, ack_level, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(source_cluster) DO UPDATE SET
                        ack_level = MAX(ack_level, excluded.ack_level),
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(source_cluster)
                .bind(ack_level)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => {
                    flushed += 1;
                    // A newer set() since the snapshot keeps the entry dirty.
                    if let Some(entry) = self.levels.write().await.get_mut(source_cluster) {
                        if entry.level == *ack_level {
                            entry.dirty = false;
                        }
                    }
                }
                Err(e) => {
                    errors += 1;
                    warn!(source_cluster = %source_cluster, error = %e, "Failed to flush ack level");
                }
            }
        }

        debug!(flushed, errors, "Flushed dirty ack levels");
        crate::metrics::record_cursor_flush(flushed, errors);
        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} of {} ack levels",
                errors,
                pending.len()
            )));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        self.levels.read().await.values().any(|a| a.dirty)
    }

    /// Forget a source removed from configuration.
    pub async fn delete(&self, source_cluster: &str) -> Result<()> {
        self.levels.write().await.remove(source_cluster);

        let pool = &self.pool;
        execute_with_retry(STORE, "delete", || async {
            sqlx::query("DELETE FROM ack_levels WHERE source_cluster = ?")
                .bind(source_cluster)
                .execute(pool)
                .await
        })
        .await?;

        info!(source_cluster = %source_cluster, "Deleted ack level");
        Ok(())
    }

    /// Every known ack level, flushed or not.
    pub async fn get_all(&self) -> HashMap<String, i64> {
        self.levels
            .read()
            .await
            .iter()
            .map(|(source, a)| (source.clone(), a.level))
            .collect()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush, checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) => info!(count, "Flushed dirty ack levels on close"),
                Err(e) => warn!(error = %e, "Failed to flush dirty ack levels on close"),
            }
        }
        if self.path != sqlite::IN_MEMORY {
            if let Err(e) = sqlite::checkpoint(&self.pool, STORE).await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}
