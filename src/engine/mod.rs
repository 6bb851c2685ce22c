// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine.
//!
//! Ties together:
//! - Pullers per source cluster via [`ReplicationTaskSource`]
//! - A sharded worker pool running the [`TaskProcessor`]
//! - Ack level persistence via [`CursorStore`]
//! - The dead-letter queue via [`DlqStore`] / [`DlqManager`]
//!
//! # Architecture
//!
//! ```text
//!  source A ──► puller A ──┐           ┌──► worker 0 ──┐
//!                          ├─ hash(run)┼──► worker 1 ──┼──► TaskProcessor ──► HistoryStore
//!  source B ──► puller B ──┘           └──► worker N ──┘         │
//!                                                                 └──► DLQ (SQLite)
//!  ack levels ◄── ProgressTracker ◄── finished tasks
//!      └──► CursorStore (SQLite, flushed every flush_interval)
//! ```
//!
//! # Startup
//!
//! 1. Open the cursor and DLQ stores
//! 2. Seed each source's ack level from the cursor store
//! 3. Re-block every run that has a DLQ entry
//! 4. Spawn workers, pullers and the ack flush task
//!
//! # Shutdown
//!
//! Pulling stops, workers finish the attempt in hand and drop queued tasks
//! (retry loops give up between attempts), ack levels are flushed, stores
//! closed.

mod puller;
mod types;
mod worker;

pub use puller::{route, shard_for};
pub use types::{EngineState, HealthCheck, SourceHealth};

use crate::applier::TaskApplier;
use crate::config::ReplicatorConfig;
use crate::cursor::CursorStore;
use crate::dlq::{DlqManager, DlqStore};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::processor::TaskProcessor;
use crate::progress::ProgressTracker;
use crate::resilience::RateLimiter;
use crate::source::ReplicationTaskSource;
use crate::storage::{ExecutionState, HistoryStore, NoOpExecutionState};
use futures::future::join_all;
use puller::PullerContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for background tasks to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The history replication engine.
///
/// The engine never owns history: it applies tasks to the [`HistoryStore`]
/// handed to it and tells the [`ExecutionState`] when the current branch of a
/// run moves.
pub struct ReplicationEngine {
    config: ReplicatorConfig,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    store: Arc<dyn HistoryStore>,
    execution: Arc<dyn ExecutionState>,
    source: Arc<dyn ReplicationTaskSource>,

    progress: Arc<ProgressTracker>,

    /// Set by `start()`.
    processor: Option<Arc<TaskProcessor>>,
    dlq_manager: Option<Arc<DlqManager>>,
    cursor_store: Option<Arc<CursorStore>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Pullers and the flush task (stopped first).
    puller_handles: Vec<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl ReplicationEngine {
    /// Create an engine that does not rebuild execution state.
    pub fn new(
        config: ReplicatorConfig,
        store: Arc<dyn HistoryStore>,
        source: Arc<dyn ReplicationTaskSource>,
    ) -> Self {
        Self::with_execution_state(config, store, Arc::new(NoOpExecutionState), source)
    }

    pub fn with_execution_state(
        config: ReplicatorConfig,
        store: Arc<dyn HistoryStore>,
        execution: Arc<dyn ExecutionState>,
        source: Arc<dyn ReplicationTaskSource>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            state_tx,
            state_rx,
            store,
            execution,
            source,
            progress: Arc::new(ProgressTracker::new()),
            processor: None,
            dlq_manager: None,
            cursor_store: None,
            shutdown_tx,
            shutdown_rx,
            puller_handles: Vec::new(),
            worker_handles: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// DLQ admin surface. `None` before `start()`.
    pub fn dlq(&self) -> Option<&Arc<DlqManager>> {
        self.dlq_manager.as_ref()
    }

    pub fn processor(&self) -> Option<&Arc<TaskProcessor>> {
        self.processor.as_ref()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Health snapshot. No I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let sources: Vec<SourceHealth> = self
            .config
            .active_sources()
            .map(|s| SourceHealth {
                source_cluster: s.name.clone(),
                ack_level: self.progress.ack_level(&s.name),
                outstanding: self.progress.outstanding(&s.name),
                parked: self.progress.parked_count(&s.name),
                blocked_runs: self.progress.blocked_count(&s.name),
            })
            .collect();

        let (storage_circuit_open, runs_in_flight) = match &self.processor {
            Some(p) => (p.applier().circuit().any_open(), p.applier().runs_in_flight()),
            None => (false, 0),
        };
        let ready = state == EngineState::Running;
        let healthy =
            ready && !storage_circuit_open && sources.iter().all(|s| s.blocked_runs == 0);

        HealthCheck {
            state,
            ready,
            healthy,
            storage_circuit_open,
            runs_in_flight,
            sources,
        }
    }

    /// Start replicating.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.config.validate()?;

        info!(
            cluster = %self.config.cluster_name,
            sources = self.config.active_sources().count(),
            workers = self.config.settings.workers.count,
            "Starting replication engine"
        );
        self.set_state(EngineState::Starting);

        if let Err(e) = self.open().await {
            error!(error = %e, "Replication engine failed to start");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        self.spawn_workers_and_pullers();
        self.spawn_ack_flush_task();

        self.set_state(EngineState::Running);
        info!("Replication engine running");
        Ok(())
    }

    /// Open stores and restore progress.
    async fn open(&mut self) -> Result<()> {
        let cursor_store = Arc::new(
            CursorStore::new(&self.config.cursor.sqlite_path, self.config.cursor.wal_mode).await?,
        );
        let dlq = Arc::new(
            DlqStore::new(&self.config.dlq.sqlite_path, self.config.dlq.wal_mode).await?,
        );

        for source in self.config.active_sources() {
            let ack_level = cursor_store.get_or_start(&source.name).await;
            self.progress.init_source(&source.name, ack_level);
            info!(source_cluster = %source.name, ack_level, "Resuming source");
        }

        let blocked = dlq.blocked_pairs().await?;
        if !blocked.is_empty() {
            warn!(count = blocked.len(), "Restoring runs blocked behind DLQ entries");
        }
        for pair in blocked {
            self.progress
                .add_blocker(&pair.source_cluster, &pair.identity, pair.task_id);
        }

        let applier = TaskApplier::new(
            Arc::clone(&self.store),
            Arc::clone(&self.execution),
            Arc::clone(&self.source),
        );
        let processor = Arc::new(TaskProcessor::new(
            applier,
            Arc::clone(&self.progress),
            dlq,
            self.config.settings.retry.to_retry_config(),
            self.shutdown_rx.clone(),
        ));

        self.dlq_manager = Some(Arc::new(DlqManager::with_page_size(
            Arc::clone(&processor),
            self.config.dlq.page_size,
        )));
        self.processor = Some(processor);
        self.cursor_store = Some(cursor_store);
        Ok(())
    }

    fn spawn_workers_and_pullers(&mut self) {
        let Some(processor) = self.processor.clone() else {
            return;
        };
        let settings = &self.config.settings;

        let mut senders = Vec::with_capacity(settings.workers.count);
        for shard in 0..settings.workers.count {
            let (tx, rx) = mpsc::channel(settings.workers.queue_capacity);
            senders.push(tx);
            let handle = tokio::spawn(worker::run_worker(
                shard,
                rx,
                Arc::clone(&processor),
                settings.slo.clone(),
                self.shutdown_rx.clone(),
            ));
            self.worker_handles.push(handle);
        }
        let shards = Arc::new(senders);
        debug!(workers = shards.len(), "Spawned workers");

        // One limiter shared by all sources.
        let rate_limiter = settings.source.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for pulls"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let sources: Vec<String> = self.config.active_sources().map(|s| s.name.clone()).collect();
        for source_cluster in sources {
            let start_after = self.progress.ack_level(&source_cluster).unwrap_or(crate::cursor::START);
            let ctx = PullerContext {
                source_cluster: source_cluster.clone(),
                source: Arc::clone(&self.source),
                shards: Arc::clone(&shards),
                progress: Arc::clone(&self.progress),
                source_config: self.config.settings.source.clone(),
                worker_config: self.config.settings.workers.clone(),
                slo: self.config.settings.slo.clone(),
                rate_limiter: rate_limiter.clone(),
            };
            let handle = tokio::spawn(puller::run_puller(ctx, start_after, self.shutdown_rx.clone()));
            info!(source_cluster = %source_cluster, "Spawned puller");
            self.puller_handles.push(handle);
        }
    }

    /// Periodically copy ack levels into the cursor store and flush.
    fn spawn_ack_flush_task(&mut self) {
        let Some(cursor_store) = self.cursor_store.clone() else {
            return;
        };
        let progress = Arc::clone(&self.progress);
        let sources: Vec<String> = self.config.active_sources().map(|s| s.name.clone()).collect();
        let flush_interval = self.config.cursor.flush_interval_duration();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        sync_ack_levels(&progress, &cursor_store, &sources).await;
                        if let Err(e) = cursor_store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush ack levels");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Ack flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned ack flush task");
        self.puller_handles.push(handle);
    }

    /// Copy current ack levels into the cursor store and flush them now.
    pub async fn flush_ack_levels(&self) -> Result<usize> {
        let Some(cursor_store) = &self.cursor_store else {
            return Ok(0);
        };
        let sources: Vec<String> = self.config.active_sources().map(|s| s.name.clone()).collect();
        sync_ack_levels(&self.progress, cursor_store, &sources).await;
        cursor_store.flush_dirty().await
    }

    /// Stop gracefully.
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let pullers = std::mem::take(&mut self.puller_handles);
        let workers = std::mem::take(&mut self.worker_handles);
        let task_count = pullers.len() + workers.len();
        if task_count > 0 {
            info!(task_count, "Waiting for pullers and workers to stop");
        }
        let drains = pullers
            .into_iter()
            .chain(workers)
            .map(|handle| tokio::time::timeout(DRAIN_TIMEOUT, handle));
        for (i, result) in join_all(drains).await.into_iter().enumerate() {
            match result {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Some(cursor_store) = self.cursor_store.take() {
            let sources: Vec<String> =
                self.config.active_sources().map(|s| s.name.clone()).collect();
            sync_ack_levels(&self.progress, &cursor_store, &sources).await;
            cursor_store.close().await;
        }
        if let Some(processor) = &self.processor {
            processor.dlq().close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }
}

async fn sync_ack_levels(progress: &ProgressTracker, cursor_store: &CursorStore, sources: &[String]) {
    for source in sources {
        let Some(ack_level) = progress.ack_level(source) else {
            continue;
        };
        if cursor_store.get(source).await != Some(ack_level) {
            cursor_store.set(source, ack_level).await;
        }
    }
}
