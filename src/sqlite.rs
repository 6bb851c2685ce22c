//! SQLite plumbing shared by the cursor and DLQ stores.
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement goes through [`execute_with_retry`], which
//! retries those errors with capped exponential backoff.

use crate::error::{ReplicationError, Result};
use crate::resilience::{Backoff, RetryConfig};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Open a pool for `path`, creating the file if needed.
///
/// [`IN_MEMORY`] opens a single-connection in-memory database (each
/// connection would otherwise see its own empty database).
pub async fn open_pool(path: &str, wal_mode: bool) -> Result<SqlitePool> {
    if path == IN_MEMORY {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
        return Ok(SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?);
    }

    let journal = if wal_mode {
        SqliteJournalMode::Wal
    } else {
        SqliteJournalMode::Delete
    };
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
        .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
        .journal_mode(journal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    Ok(SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?)
}

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6).
pub fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Backoff for busy/locked statements: 5 attempts, 10ms doubling to 500ms.
fn busy_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(500),
        backoff_factor: 2.0,
        jitter: false,
    }
}

/// Run a statement, retrying SQLITE_BUSY/SQLITE_LOCKED. Other errors return
/// immediately.
pub async fn execute_with_retry<F, Fut, T>(
    store: &str,
    operation: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut backoff = Backoff::new(busy_retry());

    loop {
        match f().await {
            Ok(result) => {
                if backoff.failures() > 0 {
                    debug!(
                        store,
                        operation,
                        busy = backoff.failures(),
                        "SQLite statement succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) => {
                let delay = backoff.fail();
                if backoff.exhausted() {
                    warn!(
                        store,
                        operation,
                        attempts = backoff.failures(),
                        "SQLite busy, giving up"
                    );
                    return Err(e);
                }
                warn!(
                    store,
                    operation,
                    attempts = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                crate::metrics::sqlite_retries_total(store, operation);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Force flush WAL to main database (for clean shutdown).
pub async fn checkpoint(pool: &SqlitePool, store: &str) -> Result<()> {
    execute_with_retry(store, "checkpoint", || async {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(pool)
            .await
    })
    .await?;
    debug!(store, "WAL checkpoint complete");
    Ok(())
}
