//! Pullers: one task per source cluster feeding the worker shards.
//!
//! Each puller:
//! 1. Pulls up to `batch_size` tasks after its cursor
//! 2. Waits for rate-limit permits (if enabled)
//! 3. Routes every task to the shard owning its run
//! 4. Registers it with the progress tracker once a queue slot is reserved
//!
//! # Backpressure
//!
//! A slot is reserved with `send_timeout`. On timeout the cursor stays at the
//! last enqueued task, the rest of the batch is dropped, and the puller pauses
//! before pulling again. Nothing is lost: the dropped tasks are pulled again.
//!
//! ```text
//! pull 11..20 → 11..14 enqueued → shard full at 15 → cursor = 14 → pause → pull 15..
//! ```

use crate::config::{SloConfig, SourceConfig, WorkerConfig};
use crate::history::{RawReplicationTask, WorkflowIdentity};
use crate::metrics;
use crate::progress::ProgressTracker;
use crate::resilience::{Backoff, RateLimiter, RetryConfig};
use crate::source::{codec, ReplicationTaskSource};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

/// Shard owning a run. Stable for the life of the process.
pub fn shard_for(identity: &WorkflowIdentity, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    identity.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Shard for a raw task. Tasks whose identity cannot be read go to shard 0.
pub fn route(raw: &RawReplicationTask, shards: usize) -> usize {
    codec::peek_identity(raw)
        .map(|identity| shard_for(&identity, shards))
        .unwrap_or(0)
}

/// Everything a puller needs, bundled to keep the spawn site readable.
pub struct PullerContext {
    pub source_cluster: String,
    pub source: Arc<dyn ReplicationTaskSource>,
    pub shards: Arc<Vec<mpsc::Sender<RawReplicationTask>>>,
    pub progress: Arc<ProgressTracker>,
    pub source_config: SourceConfig,
    pub worker_config: WorkerConfig,
    pub slo: SloConfig,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// Pull from one source cluster until shutdown.
pub async fn run_puller(ctx: PullerContext, start_after: i64, mut shutdown_rx: watch::Receiver<bool>) {
    let span = info_span!("puller", source_cluster = %ctx.source_cluster);

    async move {
        info!(start_after, "Starting puller");

        let poll_interval = ctx.source_config.poll_interval_duration();
        let send_timeout = ctx.worker_config.send_timeout_duration();
        let pause = ctx.worker_config.backpressure_pause_duration();
        let mut backoff = Backoff::new(RetryConfig::pull_errors());
        let shard_count = ctx.shards.len();

        let mut cursor = start_after;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let pull_start = Instant::now();
            let result = ctx
                .source
                .pull(&ctx.source_cluster, cursor, ctx.source_config.batch_size)
                .await;
            let pull_latency = pull_start.elapsed();
            metrics::record_pull_latency(&ctx.source_cluster, pull_latency);
            if ctx.slo.is_pull_violation(pull_latency) {
                warn!(
                    latency_ms = pull_latency.as_millis() as u64,
                    threshold_ms = ctx.slo.max_pull_latency_ms,
                    "Pull exceeded SLO"
                );
                metrics::record_slo_violation(
                    &ctx.source_cluster,
                    "pull",
                    pull_latency.as_millis() as u64,
                );
            }

            let batch = match result {
                Ok(batch) => {
                    backoff.reset();
                    batch
                }
                Err(e) => {
                    metrics::record_error(&ctx.source_cluster, e.kind());
                    let delay = backoff.fail();
                    warn!(
                        error = %e,
                        consecutive_errors = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Pull failed, backing off"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if sleep_or_shutdown(poll_interval, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }

            metrics::record_tasks_pulled(&ctx.source_cluster, batch.len());
            if let Some(limiter) = &ctx.rate_limiter {
                limiter.admit_batch(batch.len()).await;
            }

            let mut backpressured = false;
            for raw in batch {
                if raw.task_id <= cursor {
                    continue;
                }
                let shard = route(&raw, shard_count);
                let sender = &ctx.shards[shard];

                if *shutdown_rx.borrow() {
                    break;
                }

                match tokio::time::timeout(send_timeout, sender.reserve()).await {
                    Ok(Ok(permit)) => {
                        let task_id = raw.task_id;
                        ctx.progress.register(&ctx.source_cluster, task_id);
                        permit.send(raw);
                        cursor = task_id;
                        metrics::set_queue_depth(
                            shard,
                            sender.max_capacity().saturating_sub(sender.capacity()),
                        );
                    }
                    Ok(Err(_)) => {
                        debug!("Worker queue closed, stopping puller");
                        info!("Puller stopped");
                        return;
                    }
                    Err(_) => {
                        metrics::record_backpressure(&ctx.source_cluster);
                        debug!(shard, cursor, "Shard queue full, rewinding");
                        backpressured = true;
                        break;
                    }
                }
            }

            if backpressured && sleep_or_shutdown(pause, &mut shutdown_rx).await {
                break;
            }
        }

        info!("Puller stopped");
    }
    .instrument(span)
    .await
}

/// Sleep, returning `true` if shutdown was signalled meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
    }
}
