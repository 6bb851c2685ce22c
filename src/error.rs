// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the history replicator.
//!
//! Errors are categorized by how the task processor must react to them:
//! retry with backoff, attempt one backfill, or hand the task straight to the
//! dead-letter queue.
//!
//! # Error Categories
//!
//! | Error Type | Class | Description |
//! |------------|-------|-------------|
//! | `TransientStorage` | Retryable | History store unavailable, circuit open |
//! | `NetworkTimeout` | Retryable | Source cluster did not answer in time |
//! | `Redis` | Retryable | Transport errors from the Redis task source |
//! | `MissingPredecessorHistory` | Backfill | Local branch ends before the incoming events start |
//! | `VersionHistoryUnresolvable` | Terminal | Incoming history shares no root with local branches |
//! | `Serialization` | Terminal | Task payload cannot be decoded |
//! | `DlqStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! A duplicate task is not an error: the reconciler reports it as
//! [`Reconciliation::Duplicate`](crate::reconciler::Reconciliation::Duplicate)
//! and the task is acknowledged.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while reconciling and applying replication tasks.
///
/// Use [`is_retryable()`](Self::is_retryable) and
/// [`is_terminal()`](Self::is_terminal) to decide between backoff and the DLQ.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The history store failed or is temporarily unavailable.
    #[error("Transient storage error ({operation}): {message}")]
    TransientStorage { operation: String, message: String },

    /// A call to a remote cluster did not complete in time.
    #[error("Network timeout ({operation}): {message}")]
    NetworkTimeout { operation: String, message: String },

    /// Redis connection or command error from the task source.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// The local branch does not contain the events preceding the task.
    ///
    /// Triggers one backfill attempt, after which it is retried with backoff.
    #[error("Missing predecessor history for {workflow_id}: local ends at {local_last_event_id}, incoming starts at {incoming_first_event_id}")]
    MissingPredecessorHistory {
        workflow_id: String,
        local_last_event_id: i64,
        incoming_first_event_id: i64,
    },

    /// The incoming version history cannot be connected to local branches,
    /// or contradicts its own events.
    ///
    /// Terminal: retrying cannot change an LCA lookup failure.
    #[error("Version history unresolvable: {0}")]
    VersionHistoryUnresolvable(String),

    /// The task payload could not be decoded.
    ///
    /// Terminal and bypasses the retry budget.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite error in the DLQ store.
    #[error("DLQ store error: {0}")]
    DlqStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient storage error.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientStorage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a network timeout error.
    pub fn timeout(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NetworkTimeout {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientStorage { .. } => true,
            Self::NetworkTimeout { .. } => true,
            Self::Redis { .. } => true,
            Self::MissingPredecessorHistory { .. } => true, // after the one backfill
            Self::VersionHistoryUnresolvable(_) => false,
            Self::Serialization(_) => false,
            Self::DlqStore(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error sends the task straight to the DLQ.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::VersionHistoryUnresolvable(_) | Self::Serialization(_)
        )
    }

    /// Check if this error should trigger a backfill fetch.
    pub fn needs_backfill(&self) -> bool {
        matches!(self, Self::MissingPredecessorHistory { .. })
    }

    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientStorage { .. } => "transient_storage",
            Self::NetworkTimeout { .. } => "network_timeout",
            Self::Redis { .. } => "redis",
            Self::MissingPredecessorHistory { .. } => "missing_predecessor",
            Self::VersionHistoryUnresolvable(_) => "unresolvable",
            Self::Serialization(_) => "serialization",
            Self::DlqStore(_) => "dlq_store",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
