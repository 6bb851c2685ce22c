//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (stores opened, blocks restored)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ── (store or config error) ──→ Failed
//! ```
//!
//! - **Created**: after `ReplicationEngine::new()`. Nothing opened.
//! - **Starting**: opening SQLite stores, restoring ack levels and blocked runs.
//! - **Running**: pullers and workers active.
//! - **ShuttingDown**: pulling stopped, in-flight attempts finishing.
//! - **Stopped**: ack levels flushed, stores closed.
//! - **Failed**: `start()` could not complete. Check logs.

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Per-source progress snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceHealth {
    pub source_cluster: String,
    /// Highest task ID below which everything is finished.
    pub ack_level: Option<i64>,
    /// Pulled tasks not yet finished.
    pub outstanding: usize,
    /// Tasks waiting behind blocked runs.
    pub parked: usize,
    /// Runs blocked behind a DLQ entry.
    pub blocked_runs: usize,
}

/// Health snapshot for monitoring endpoints. Built from in-memory state only.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running.
    pub ready: bool,
    /// Ready, no storage circuit open and no blocked runs.
    pub healthy: bool,
    pub storage_circuit_open: bool,
    /// Runs currently inside an apply attempt.
    pub runs_in_flight: usize,
    pub sources: Vec<SourceHealth>,
}
