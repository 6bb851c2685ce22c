//! Task processor: decoding, ordering, retries and dead-lettering.
//!
//! Wraps the [`TaskApplier`] with everything that happens around a single
//! attempt:
//!
//! 1. Decode the raw payload (undecodable → DLQ at once, blocking its run
//!    when the identity is still readable)
//! 2. Offer the task to the ordering gate (blocked run → parked)
//! 3. Skip tasks at or below the run's watermark
//! 4. Retry retryable failures with jittered exponential backoff, persisting
//!    the attempt count on every failure
//! 5. On terminal failure or an exhausted budget: block the run, DLQ
//! 6. Finish the task so the source ack level can move past it
//!
//! A task is only finished once its DLQ entry is stored. The write is retried
//! until shutdown; if shutdown comes first the block is lifted and the task is
//! abandoned for redelivery.
//!
//! Re-driving a DLQ entry ([`redrive`](TaskProcessor::redrive)) and draining
//! parked tasks ([`drain_parked`](TaskProcessor::drain_parked)) are used by the
//! [`DlqManager`](crate::dlq::DlqManager).

use crate::applier::{ApplyOutcome, TaskApplier};
use crate::dlq::{DlqEntry, DlqStore};
use crate::error::{ReplicationError, Result};
use crate::history::{RawReplicationTask, ReplicationTask, WorkflowIdentity};
use crate::metrics;
use crate::progress::{Admission, ProgressTracker};
use crate::resilience::{Backoff, RetryConfig};
use crate::source::codec;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What happened to a task handed to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Already applied, or the task already sitting in the DLQ.
    Skipped,
    /// Waiting behind a blocked run.
    Parked,
    /// Stored in the DLQ.
    DeadLettered,
    /// Given up because of shutdown; it will be redelivered.
    Abandoned,
}

/// Result of the retry loop.
enum Attempted {
    Applied(ApplyOutcome),
    Failed {
        error: ReplicationError,
        attempts: u32,
        first_failure: DateTime<Utc>,
    },
    Abandoned,
}

/// Handles tasks end to end for the worker pool.
pub struct TaskProcessor {
    applier: TaskApplier,
    progress: Arc<ProgressTracker>,
    dlq: Arc<DlqStore>,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
}

impl TaskProcessor {
    pub fn new(
        applier: TaskApplier,
        progress: Arc<ProgressTracker>,
        dlq: Arc<DlqStore>,
        retry: RetryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            applier,
            progress,
            dlq,
            retry,
            shutdown,
        }
    }

    pub fn applier(&self) -> &TaskApplier {
        &self.applier
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn dlq(&self) -> &Arc<DlqStore> {
        &self.dlq
    }

    /// Handle a pulled task. The task must have been registered with the
    /// progress tracker; it is finished unless parked or abandoned.
    pub async fn process(&self, raw: RawReplicationTask) -> Result<Disposition> {
        let span = info_span!(
            "task",
            source_cluster = %raw.source_cluster,
            task_id = raw.task_id,
            workflow_id = tracing::field::Empty,
        );
        async move {
            let task = match codec::decode_task(&raw) {
                Ok(task) => task,
                Err(e) => return Ok(self.handle_undecodable(raw, e).await),
            };
            tracing::Span::current().record("workflow_id", task.identity.workflow_id.as_str());

            match self.progress.admit(task) {
                Admission::Proceed(task) => self.handle(task, Some(raw)).await,
                Admission::AlreadyInDlq => {
                    metrics::record_task_skipped(&raw.source_cluster, "already_in_dlq");
                    self.progress.finish(&raw.source_cluster, raw.task_id);
                    Ok(Disposition::Skipped)
                }
                Admission::Parked => {
                    debug!("Run is blocked, task parked");
                    Ok(Disposition::Parked)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Apply an admitted task with retries, then record the outcome.
    async fn handle(
        &self,
        task: ReplicationTask,
        raw: Option<RawReplicationTask>,
    ) -> Result<Disposition> {
        let source = task.source_cluster.clone();
        if self.progress.is_applied(&source, &task.identity, task.task_id) {
            metrics::record_task_skipped(&source, "below_watermark");
            self.progress.finish(&source, task.task_id);
            return Ok(Disposition::Skipped);
        }

        match self.apply_with_retry(&task).await {
            Attempted::Applied(_) => {
                self.mark_applied(&task).await;
                Ok(Disposition::Applied)
            }
            Attempted::Failed {
                error,
                attempts,
                first_failure,
            } => {
                let raw = match raw {
                    Some(raw) => raw,
                    None => codec::to_raw(&task, false)?,
                };
                let entry = DlqEntry {
                    source_cluster: source.clone(),
                    task_id: task.task_id,
                    identity: Some(task.identity.clone()),
                    first_failure_time: first_failure,
                    attempt_count: attempts,
                    last_error: error.to_string(),
                    raw_task: raw,
                };
                // Later tasks of the run must not overtake this one while
                // the entry is being written.
                self.progress.block(&source, &task.identity, task.task_id);
                if !self.store_dead_letter(&entry, error.kind()).await {
                    self.progress.unblock(&source, &task.identity, task.task_id);
                    return Ok(Disposition::Abandoned);
                }
                if let Err(e) = self.dlq.clear_retry(&source, task.task_id).await {
                    warn!(error = %e, "Failed to clear retry state");
                }
                self.progress.finish(&source, task.task_id);
                Ok(Disposition::DeadLettered)
            }
            Attempted::Abandoned => Ok(Disposition::Abandoned),
        }
    }

    /// Dead-letter a task whose payload does not decode. If the envelope
    /// still names its run, the run is blocked like after any other terminal
    /// failure.
    async fn handle_undecodable(
        &self,
        raw: RawReplicationTask,
        error: ReplicationError,
    ) -> Disposition {
        let identity = codec::peek_identity(&raw);
        warn!(
            error = %error,
            blocks_run = identity.is_some(),
            "Undecodable task"
        );
        let source = raw.source_cluster.clone();
        let task_id = raw.task_id;
        let added = identity
            .as_ref()
            .is_some_and(|identity| self.progress.add_blocker(&source, identity, task_id));
        let entry = DlqEntry {
            source_cluster: source.clone(),
            task_id,
            identity,
            first_failure_time: Utc::now(),
            attempt_count: 1,
            last_error: error.to_string(),
            raw_task: raw,
        };
        if !self.store_dead_letter(&entry, error.kind()).await {
            if let (true, Some(identity)) = (added, &entry.identity) {
                self.progress.unblock(&source, identity, task_id);
            }
            return Disposition::Abandoned;
        }
        self.progress.finish(&source, task_id);
        Disposition::DeadLettered
    }

    /// Write a DLQ entry, retrying until it is stored. Returns false if
    /// shutdown came first.
    async fn store_dead_letter(&self, entry: &DlqEntry, error_kind: &str) -> bool {
        let mut backoff = Backoff::new(RetryConfig::dlq_writes());
        let mut shutdown = self.shutdown.clone();
        loop {
            if self.put_dlq(entry, error_kind).await.is_ok() {
                return true;
            }
            let delay = backoff.fail();
            metrics::record_retry(&entry.source_cluster, "dlq_write");
            debug!(
                attempts = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "Retrying DLQ write"
            );
            let stopped = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                // A dropped sender means the engine is gone.
                changed = shutdown.changed() => changed.is_err(),
            };
            if stopped || *shutdown.borrow() {
                warn!(
                    source_cluster = %entry.source_cluster,
                    task_id = entry.task_id,
                    "Shutdown before DLQ write succeeded, task left for redelivery"
                );
                return false;
            }
        }
    }

    /// Retry loop around [`TaskApplier::apply`].
    async fn apply_with_retry(&self, task: &ReplicationTask) -> Attempted {
        let source = &task.source_cluster;
        let (mut attempts, mut first_failure) =
            match self.dlq.retry_state(source, task.task_id).await {
                Ok(Some(record)) => (record.attempt_count, Some(record.first_failure_time)),
                Ok(None) => (0, None),
                Err(e) => {
                    warn!(error = %e, "Failed to load retry state");
                    (0, None)
                }
            };
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                return Attempted::Abandoned;
            }

            let error = match self.applier.apply(task).await {
                Ok(outcome) => return Attempted::Applied(outcome),
                Err(ReplicationError::Shutdown) => return Attempted::Abandoned,
                Err(e) => e,
            };

            attempts = attempts.saturating_add(1);
            let first = *first_failure.get_or_insert_with(Utc::now);

            if error.is_terminal() {
                return Attempted::Failed {
                    error,
                    attempts,
                    first_failure: first,
                };
            }

            metrics::record_retry(source, error.kind());
            if let Err(e) = self
                .dlq
                .record_retry(source, task.task_id, attempts, first, &error.to_string())
                .await
            {
                warn!(error = %e, "Failed to persist retry state");
            }

            if !self.retry.allows_another(attempts as usize) {
                warn!(
                    attempts,
                    error = %error,
                    "Retry budget exhausted"
                );
                return Attempted::Failed {
                    error,
                    attempts,
                    first_failure: first,
                };
            }

            let delay = self.retry.jittered_delay_for_attempt(attempts as usize);
            debug!(
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying task"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Attempted::Abandoned;
                    }
                }
            }
        }
    }

    async fn mark_applied(&self, task: &ReplicationTask) {
        let source = &task.source_cluster;
        self.progress
            .advance_watermark(source, &task.identity, task.task_id);
        if let Err(e) = self.dlq.clear_retry(source, task.task_id).await {
            warn!(error = %e, "Failed to clear retry state");
        }
        self.progress.finish(source, task.task_id);
    }

    async fn put_dlq(&self, entry: &DlqEntry, error_kind: &str) -> Result<bool> {
        let inserted = self.dlq.put(entry).await.map_err(|e| {
            error!(
                source_cluster = %entry.source_cluster,
                task_id = entry.task_id,
                error = %e,
                "Failed to write DLQ entry"
            );
            e
        })?;
        if inserted {
            metrics::record_dlq_put(&entry.source_cluster, error_kind);
            warn!(
                source_cluster = %entry.source_cluster,
                task_id = entry.task_id,
                attempts = entry.attempt_count,
                error = %entry.last_error,
                "Task moved to DLQ"
            );
        }
        Ok(inserted)
    }

    /// Store an entry in the DLQ and block its run. A failed write leaves
    /// the run as it was.
    pub async fn dead_letter(&self, entry: DlqEntry) -> Result<bool> {
        let source = &entry.source_cluster;
        let added = entry
            .identity
            .as_ref()
            .is_some_and(|identity| self.progress.add_blocker(source, identity, entry.task_id));
        let stored = self.put_dlq(&entry, "manual").await;
        if let (Err(_), true, Some(identity)) = (&stored, added, &entry.identity) {
            self.progress.unblock(source, identity, entry.task_id);
        }
        stored
    }

    /// One attempt at a DLQ entry, without retries.
    ///
    /// On success the run's watermark is advanced. The entry itself is left
    /// for the caller to delete.
    pub async fn redrive(&self, entry: &DlqEntry) -> Result<ApplyOutcome> {
        let task = codec::decode_task(&entry.raw_task)?;
        let outcome = self.applier.apply(&task).await?;
        self.progress
            .advance_watermark(&task.source_cluster, &task.identity, task.task_id);
        if let Err(e) = self.dlq.clear_retry(&task.source_cluster, task.task_id).await {
            warn!(error = %e, "Failed to clear retry state");
        }
        Ok(outcome)
    }

    /// Hand a run's parked tasks to the applier in arrival order until the
    /// gate opens, a later DLQ entry of the run takes over the block, or one
    /// of them fails terminally (which re-blocks the run).
    ///
    /// Returns the number of parked tasks handled.
    pub async fn drain_parked(&self, source_cluster: &str, identity: &WorkflowIdentity) -> Result<usize> {
        let mut handled = 0;
        loop {
            while let Some(task) = self.progress.release_next(source_cluster, identity) {
                handled += 1;
                match self.handle(task, None).await? {
                    Disposition::DeadLettered => {
                        info!(
                            source_cluster = %source_cluster,
                            workflow = %identity,
                            handled,
                            "Parked task failed, run blocked again"
                        );
                        return Ok(handled);
                    }
                    Disposition::Abandoned => return Ok(handled),
                    _ => {}
                }
            }
            // Stopped at a queued entry: keep going if it has left the DLQ.
            let Some(blocker) = self.progress.blocked_by(source_cluster, identity) else {
                return Ok(handled);
            };
            if self.dlq.get(source_cluster, blocker).await?.is_some() {
                debug!(blocked_by = blocker, handled, "Drain stopped at DLQ entry");
                return Ok(handled);
            }
        }
    }
}
