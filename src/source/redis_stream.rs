// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams task source.
//!
//! Each source cluster publishes to its own stream, `{prefix}replication:{cluster}`.
//! Entries are added with the explicit ID `{task_id}-0`, so "tasks after N" is
//! a plain exclusive `XRANGE` from `(N-0`.
//!
//! # Entry Fields
//!
//! | Field | Required | Description |
//! |-------|----------|-------------|
//! | `task_id` | no | Task ID; the stream ID is used when absent |
//! | `payload` | yes | JSON envelope, zstd-compressed if the magic header is present |
//! | `hash` | no | SHA-256 (hex) of the decompressed payload |
//!
//! Entries with missing or malformed fields are still delivered, with an empty
//! payload if need be, so they fail decoding and land in the DLQ instead of
//! being skipped.
//!
//! Full histories for backfill are JSON values at
//! `{prefix}history:{cluster}:{domain}:{workflow}:{run}`.

use super::{codec, ReplicationTaskSource};
use crate::config::SourceConfig;
use crate::error::{ReplicationError, Result};
use crate::history::{FullHistory, RawReplicationTask, ReplicationTask, WorkflowIdentity};
use crate::resilience::{Backoff, RetryConfig};
use crate::storage::BoxFuture;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, trace, warn};

type StreamEntries = Vec<(String, HashMap<String, redis::Value>)>;

/// Connect and command timeout unless configured otherwise.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Task source backed by Redis Streams.
#[derive(Clone)]
pub struct RedisTaskSource {
    /// ConnectionManager is Clone and multiplexed, so sharing is cheap.
    conn: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
}

impl RedisTaskSource {
    /// Connect with retry, giving up after `retry.max_attempts`. Each attempt,
    /// and every command afterwards, is bounded by [`DEFAULT_COMMAND_TIMEOUT`].
    pub async fn connect(
        redis_url: &str,
        key_prefix: impl Into<String>,
        retry: &RetryConfig,
    ) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| ReplicationError::Config(format!("Invalid Redis URL: {}", e)))?;

        let mut backoff = Backoff::new(retry.clone());
        loop {
            let failure =
                match timeout(DEFAULT_COMMAND_TIMEOUT, client.get_connection_manager()).await {
                    Ok(Ok(conn)) => {
                        info!(
                            url = %redis_url,
                            attempt = backoff.failures() + 1,
                            "Connected to task source"
                        );
                        return Ok(Self::from_connection(conn, key_prefix, DEFAULT_COMMAND_TIMEOUT));
                    }
                    Ok(Err(e)) => ReplicationError::redis("connect", e),
                    Err(_) => ReplicationError::timeout(
                        "connect",
                        format!("no connection within {:?}", DEFAULT_COMMAND_TIMEOUT),
                    ),
                };

            let delay = backoff.fail();
            if backoff.exhausted() {
                return Err(failure);
            }
            warn!(
                url = %redis_url,
                attempt = backoff.failures(),
                error = %failure,
                "Task source connection failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Connect using the `source` section of the configuration.
    pub async fn from_config(config: &SourceConfig) -> Result<Self> {
        let url = config.redis_url.as_deref().ok_or_else(|| {
            ReplicationError::Config("source.redis_url is not set".to_string())
        })?;
        let retry = RetryConfig::source_connect();
        let mut source = Self::connect(url, config.redis_prefix.clone(), &retry).await?;
        source.command_timeout = config.command_timeout_duration();
        Ok(source)
    }

    /// Wrap an existing connection.
    pub fn from_connection(
        conn: ConnectionManager,
        key_prefix: impl Into<String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            command_timeout,
        }
    }

    pub fn stream_key(&self, source_cluster: &str) -> String {
        format!("{}replication:{}", self.key_prefix, source_cluster)
    }

    pub fn history_key(&self, source_cluster: &str, identity: &WorkflowIdentity) -> String {
        format!(
            "{}history:{}:{}:{}:{}",
            self.key_prefix,
            source_cluster,
            identity.domain_id,
            identity.workflow_id,
            identity.run_id
        )
    }

    /// Publish a task on its source cluster's stream (producer side).
    pub async fn publish(&self, task: &ReplicationTask, compress: bool) -> Result<()> {
        if task.task_id < 1 {
            return Err(ReplicationError::Serialization(format!(
                "task id {} cannot be used as a stream id",
                task.task_id
            )));
        }
        let raw = codec::to_raw(task, compress)?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(&task.source_cluster))
            .arg(format!("{}-0", task.task_id))
            .arg("task_id")
            .arg(task.task_id)
            .arg("payload")
            .arg(raw.payload);
        if let Some(hash) = raw.content_hash {
            cmd.arg("hash").arg(hash);
        }
        let _: String = self.run("XADD", cmd).await?;
        Ok(())
    }

    /// Store a run's full history for backfill requests (producer side).
    pub async fn put_full_history(
        &self,
        source_cluster: &str,
        identity: &WorkflowIdentity,
        history: &FullHistory,
    ) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.history_key(source_cluster, identity))
            .arg(codec::encode_full_history(history)?);
        let _: () = self.run("SET", cmd).await?;
        Ok(())
    }

    /// Run one command with the command timeout.
    async fn run<T: FromRedisValue>(&self, operation: &str, cmd: redis::Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        with_timeout(operation, self.command_timeout, async move {
            cmd.query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::redis(operation, e))
        })
        .await
    }

    async fn read_range(
        &self,
        source_cluster: &str,
        after_task_id: i64,
        max_batch: usize,
    ) -> Result<Vec<RawReplicationTask>> {
        // XRANGE is inclusive; "(" makes the start exclusive (Redis 6.2+).
        let start = if after_task_id < 1 {
            "-".to_string()
        } else {
            format!("({}-0", after_task_id)
        };

        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(self.stream_key(source_cluster))
            .arg(&start)
            .arg("+")
            .arg("COUNT")
            .arg(max_batch);
        let entries: StreamEntries = self.run("XRANGE", cmd).await?;

        let tasks: Vec<RawReplicationTask> = entries
            .into_iter()
            .filter_map(|(stream_id, fields)| parse_entry(source_cluster, &stream_id, &fields))
            .filter(|raw| raw.task_id > after_task_id)
            .collect();

        if !tasks.is_empty() {
            trace!(
                source_cluster = %source_cluster,
                count = tasks.len(),
                first_task_id = tasks.first().map(|t| t.task_id).unwrap_or_default(),
                last_task_id = tasks.last().map(|t| t.task_id).unwrap_or_default(),
                "Read replication tasks via XRANGE"
            );
        }
        Ok(tasks)
    }
}

impl ReplicationTaskSource for RedisTaskSource {
    fn pull<'a>(
        &'a self,
        source_cluster: &'a str,
        after_task_id: i64,
        max_batch: usize,
    ) -> BoxFuture<'a, Vec<RawReplicationTask>> {
        Box::pin(self.read_range(source_cluster, after_task_id, max_batch))
    }

    fn fetch_full_history<'a>(
        &'a self,
        source_cluster: &'a str,
        identity: &'a WorkflowIdentity,
    ) -> BoxFuture<'a, FullHistory> {
        Box::pin(async move {
            let mut cmd = redis::cmd("GET");
            cmd.arg(self.history_key(source_cluster, identity));
            let data: Option<Vec<u8>> = self.run("GET", cmd).await?;
            let data = data.ok_or_else(|| {
                ReplicationError::timeout(
                    "fetch_full_history",
                    format!("{} has no history for {}", source_cluster, identity),
                )
            })?;
            codec::decode_full_history(&data)
        })
    }
}

async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ReplicationError::timeout(
            operation,
            format!("no reply within {:?}", limit),
        )),
    }
}

/// Turn a stream entry into a raw task. Only entries without any usable task
/// id are dropped, since they cannot be ordered.
fn parse_entry(
    source_cluster: &str,
    stream_id: &str,
    fields: &HashMap<String, redis::Value>,
) -> Option<RawReplicationTask> {
    let task_id = get_string_field(fields, "task_id")
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| task_id_from_stream_id(stream_id));
    let Some(task_id) = task_id else {
        warn!(source_cluster = %source_cluster, stream_id = %stream_id, "Stream entry has no task id, skipping");
        return None;
    };

    let payload = match get_bytes_field(fields, "payload") {
        Some(bytes) => bytes,
        None => {
            warn!(source_cluster = %source_cluster, task_id, "Stream entry has no payload");
            Vec::new()
        }
    };

    Some(RawReplicationTask {
        source_cluster: source_cluster.to_string(),
        task_id,
        payload,
        content_hash: get_string_field(fields, "hash"),
    })
}

/// Task ID encoded in a `{task_id}-{seq}` stream ID.
pub fn task_id_from_stream_id(stream_id: &str) -> Option<i64> {
    stream_id.split('-').next()?.parse().ok()
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Option<Vec<u8>> {
    match fields.get(name)? {
        redis::Value::BulkString(bytes) => Some(bytes.clone()),
        redis::Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}
