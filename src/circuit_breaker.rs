//! Circuit breakers in front of the history store.
//!
//! A store that is down makes every worker burn its retry budget against the
//! same wall. Once a circuit opens, calls are rejected without touching the
//! store and surface as retryable [`ReplicationError::TransientStorage`], so
//! the task simply backs off like any other transient failure. Built on
//! `recloser`.
//!
//! Only store-health failures count against a circuit: a store that answers
//! quickly with "gap in event IDs" is healthy, and a burst of malformed tasks
//! must not lock every other run out of storage.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use history_replicator::circuit_breaker::StorageCircuit;
//! # use history_replicator::error::Result;
//! # async fn example() -> Result<()> {
//! let circuit = StorageCircuit::new();
//!
//! let value = circuit.read("load_version_histories", || async { Ok(42) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a circuit-protected call that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open and the call never ran.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The call ran and failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

impl CircuitError<ReplicationError> {
    /// Flatten into a replication error. Rejections are retryable storage
    /// failures attributed to `operation`.
    pub fn into_replication(self, operation: &str) -> ReplicationError {
        match self {
            CircuitError::Rejected => {
                ReplicationError::storage(operation, "circuit breaker open, request rejected")
            }
            CircuitError::Inner(e) => e,
        }
    }
}

/// Trip and recovery settings for one circuit.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Share of failed calls (0.0 to 1.0) in the closed window that opens
    /// the circuit.
    pub failure_rate: f32,
    /// Calls observed while closed before the failure rate is evaluated.
    pub window: usize,
    /// Trial calls let through while half-open.
    pub probe_calls: usize,
    /// Time spent open before probing.
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::reads()
    }
}

impl CircuitConfig {
    /// Appends, forks and commits. Opens on a smaller window and probes with
    /// more calls before closing, since a half-working store can leave
    /// orphaned branches behind.
    #[must_use]
    pub fn writes() -> Self {
        Self {
            failure_rate: 0.5,
            window: 10,
            probe_calls: 3,
            open_wait: Duration::from_secs(30),
        }
    }

    /// Loads and event reads.
    #[must_use]
    pub fn reads() -> Self {
        Self {
            failure_rate: 0.5,
            window: 20,
            probe_calls: 2,
            open_wait: Duration::from_secs(15),
        }
    }

    /// Opens after two failures and probes after 50ms.
    #[must_use]
    pub fn test() -> Self {
        Self {
            failure_rate: 0.5,
            window: 2,
            probe_calls: 1,
            open_wait: Duration::from_millis(50),
        }
    }

    fn build(&self) -> AsyncRecloser {
        Recloser::custom()
            .error_rate(self.failure_rate.clamp(0.0, 1.0))
            .closed_len(self.window.max(1))
            .half_open_len(self.probe_calls.max(1))
            .open_wait(self.open_wait)
            .build()
            .into()
    }
}

/// A named circuit with call counters.
pub struct CircuitBreaker {
    name: &'static str,
    inner: AsyncRecloser,
    /// Set by a rejection, cleared by the next call that reaches the store.
    open: AtomicBool,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: &CircuitConfig) -> Self {
        metrics::set_circuit_state(name, "closed");
        Self {
            name,
            inner: config.build(),
            open: AtomicBool::new(false),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `f` through the circuit. Every failure counts against it.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.call_with(|_: &E| true, f).await
    }

    /// Run `f` through the circuit. Only failures for which `counts` returns
    /// true move the circuit toward open.
    pub async fn call_with<F, Fut, T, E, P>(
        &self,
        counts: P,
        f: F,
    ) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call_with(counts, f()).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.reached_store();
                metrics::record_circuit_call(self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(self.name, "rejected");
                if !self.open.swap(true, Ordering::Relaxed) {
                    warn!(circuit = self.name, "Circuit opened, rejecting store calls");
                    metrics::set_circuit_state(self.name, "open");
                }
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.reached_store();
                metrics::record_circuit_call(self.name, "failure");
                debug!(circuit = self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn reached_store(&self) {
        if self.open.swap(false, Ordering::Relaxed) {
            info!(circuit = self.name, "Circuit probing store again");
            metrics::set_circuit_state(self.name, "half_open");
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Whether the last call was rejected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// Whether a store error says anything about store health.
fn is_store_failure(err: &ReplicationError) -> bool {
    err.is_retryable()
}

/// Circuits guarding [`HistoryStore`](crate::storage::HistoryStore) calls.
pub struct StorageCircuit {
    /// Branch creation, appends, forks and version-history saves.
    pub writes: CircuitBreaker,
    /// Loads and event reads.
    pub reads: CircuitBreaker,
}

impl Default for StorageCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageCircuit {
    pub fn new() -> Self {
        Self::with_configs(CircuitConfig::writes(), CircuitConfig::reads())
    }

    pub fn with_configs(writes: CircuitConfig, reads: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new("history_writes", &writes),
            reads: CircuitBreaker::new("history_reads", &reads),
        }
    }

    /// Run a store write through the write circuit.
    pub async fn write<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.writes
            .call_with(is_store_failure, f)
            .await
            .map_err(|e| e.into_replication(operation))
    }

    /// Run a store read through the read circuit.
    pub async fn read<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.reads
            .call_with(is_store_failure, f)
            .await
            .map_err(|e| e.into_replication(operation))
    }

    pub fn any_open(&self) -> bool {
        self.writes.is_open() || self.reads.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down() -> ReplicationError {
        ReplicationError::storage("save_version_histories", "down")
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", &CircuitConfig::test());

        let result: std::result::Result<i32, CircuitError<&str>> =
            cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert!(!cb.is_open());
    }

    #[tokio::test]
    async fn test_circuit_opens_after_window_of_failures() {
        let cb = CircuitBreaker::new("test", &CircuitConfig::test());

        for _ in 0..6 {
            let _: std::result::Result<i32, CircuitError<&str>> =
                cb.call(|| async { Err("fail") }).await;
        }

        assert!(cb.rejections() >= 1);
        assert!(cb.is_open());
        assert_eq!(cb.failures() + cb.rejections(), 6);
    }

    #[tokio::test]
    async fn test_storage_circuit_passes_inner_error_through() {
        let circuit = StorageCircuit::new();
        let err = circuit
            .write("append_history_events", || async {
                Err::<(), _>(ReplicationError::Internal("gap".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Internal(_)));
        assert_eq!(circuit.writes.failures(), 1);
        assert_eq!(circuit.reads.calls_total(), 0);
    }

    #[tokio::test]
    async fn test_non_storage_errors_do_not_open_circuit() {
        let circuit = StorageCircuit::with_configs(CircuitConfig::test(), CircuitConfig::test());
        for _ in 0..10 {
            let err = circuit
                .write("append_history_events", || async {
                    Err::<(), _>(ReplicationError::Internal("gap".to_string()))
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ReplicationError::Internal(_)));
        }
        assert_eq!(circuit.writes.rejections(), 0);
        assert!(!circuit.any_open());
    }

    #[test]
    fn test_rejection_maps_to_retryable_storage_error() {
        let err = CircuitError::<ReplicationError>::Rejected.into_replication("fork_history");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("fork_history"));
    }

    #[tokio::test]
    async fn test_open_storage_circuit_fails_fast_then_recovers() {
        let circuit = StorageCircuit::with_configs(CircuitConfig::test(), CircuitConfig::test());

        for _ in 0..10 {
            let err = circuit
                .write("save_version_histories", || async { Err::<(), _>(down()) })
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(circuit.writes.rejections() >= 1);
        assert!(circuit.any_open());

        tokio::time::sleep(Duration::from_millis(80)).await;
        circuit
            .write("save_version_histories", || async { Ok(()) })
            .await
            .unwrap();
        assert!(!circuit.any_open());
    }
}
