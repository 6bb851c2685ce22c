//! Workers: one per shard, handling tasks in queue order.
//!
//! A run always hashes to the same shard, so its tasks reach the processor in
//! task-ID order. On shutdown the worker finishes the task in hand and drops
//! whatever is still queued; those tasks were never finished, so the ack level
//! stays below them and they are pulled again after restart.

use crate::config::SloConfig;
use crate::history::RawReplicationTask;
use crate::metrics;
use crate::processor::{Disposition, TaskProcessor};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Drain one shard until its queue closes or shutdown is signalled.
pub async fn run_worker(
    shard: usize,
    mut queue: mpsc::Receiver<RawReplicationTask>,
    processor: Arc<TaskProcessor>,
    slo: SloConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("worker", shard);

    async move {
        debug!("Worker started");
        let mut handled: u64 = 0;

        loop {
            let raw = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                raw = queue.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };

            let source_cluster = raw.source_cluster.clone();
            let task_id = raw.task_id;
            let start = Instant::now();
            match processor.process(raw).await {
                Ok(Disposition::Applied) => {
                    let elapsed = start.elapsed();
                    if slo.is_apply_violation(elapsed) {
                        warn!(
                            source_cluster = %source_cluster,
                            task_id,
                            latency_ms = elapsed.as_millis() as u64,
                            "Apply exceeded SLO"
                        );
                        metrics::record_slo_violation(
                            &source_cluster,
                            "apply",
                            elapsed.as_millis() as u64,
                        );
                    }
                }
                Ok(Disposition::Abandoned) => break,
                Ok(_) => {}
                Err(e) => {
                    // Not finished: the ack level stays pinned below it.
                    error!(
                        source_cluster = %source_cluster,
                        task_id,
                        error = %e,
                        "Task could not be handled"
                    );
                }
            }
            handled += 1;
            metrics::set_queue_depth(shard, queue.len());
        }

        let dropped = queue.len();
        queue.close();
        info!(handled, dropped, "Worker stopped");
    }
    .instrument(span)
    .await
}
