//! # History Replicator
//!
//! Cross-cluster replication of workflow histories.
//!
//! ## Architecture
//!
//! Every workflow run is written by one active cluster at a time and
//! replicated to the others as an ordered stream of replication tasks. When
//! the active cluster changes, the same run can grow divergent branches. The
//! replicator reconciles each incoming task against the branches already
//! stored locally and applies it:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           history-replicator                              │
//! │                                                                           │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────┐   ┌───────────┐  │
//! │  │ TaskSource   │──►│ Puller       │──►│ Worker shards │──►│ Processor │  │
//! │  │ (per remote) │   │ (per remote) │   │ (hash of run) │   │ + Applier │  │
//! │  └──────────────┘   └──────────────┘   └───────────────┘   └───────────┘  │
//! │         ▲                  │                                 │     │      │
//! │         │ backfill         ▼                                 ▼     ▼      │
//! │         │           ┌─────────────┐                 ┌──────────┐ ┌─────┐  │
//! │         └───────────│ CursorStore │                 │ History  │ │ DLQ │  │
//! │                     │ (ack level) │                 │ Store    │ │     │  │
//! │                     └─────────────┘                 └──────────┘ └─────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reconciliation
//!
//! Each task carries the version history of the branch it belongs to. The
//! [`reconciler`] compares it with the local [`VersionHistories`] and decides
//! whether to create the run, extend a branch, fork a new branch at the lowest
//! common ancestor, skip a duplicate, or fetch the full history first
//! (backfill). When the current branch changes, the [`ExecutionState`] is
//! rebuilt from the new branch.
//!
//! ## Failure handling
//!
//! Retryable failures are retried with backoff. Tasks that cannot be applied
//! go to the dead-letter queue and block their run until an operator merges
//! or deletes them through the [`DlqManager`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use history_replicator::{
//!     InMemoryHistoryStore, InMemoryTaskSource, ReplicationEngine, ReplicatorConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicatorConfig::default();
//!     let store = Arc::new(InMemoryHistoryStore::new());
//!     let source = Arc::new(InMemoryTaskSource::new());
//!
//!     let mut engine = ReplicationEngine::new(config, store, source);
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod applier;
pub mod circuit_breaker;
pub mod config;
pub mod cursor;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod history;
pub mod locks;
pub mod metrics;
pub mod processor;
pub mod progress;
pub mod reconciler;
pub mod resilience;
pub mod source;
pub mod sqlite;
pub mod storage;

// Re-exports for convenience
pub use applier::{ApplyOutcome, TaskApplier, TaskState};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StorageCircuit};
pub use config::{
    CursorConfig, DlqConfig, ReplicatorConfig, ReplicatorSettings, SourceClusterConfig,
    SourceConfig, TaskRetryConfig, WorkerConfig,
};
pub use cursor::CursorStore;
pub use dlq::{DlqEntry, DlqManager, DlqPage, DlqStore, MergeReport};
pub use engine::{EngineState, HealthCheck, ReplicationEngine, SourceHealth};
pub use error::{ReplicationError, Result};
pub use history::{
    BranchToken, FullHistory, HistoryBatch, HistoryEvent, RawReplicationTask, ReplicationTask,
    VersionHistories, VersionHistory, VersionHistoryItem, WorkflowIdentity,
};
pub use processor::{Disposition, TaskProcessor};
pub use progress::ProgressTracker;
pub use reconciler::{reconcile, Reconciliation};
pub use source::{InMemoryTaskSource, RedisTaskSource, ReplicationTaskSource};
pub use storage::{ExecutionState, HistoryStore, InMemoryHistoryStore, NoOpExecutionState};
