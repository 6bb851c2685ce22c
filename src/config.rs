//! Configuration for the history replicator.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use history_replicator::config::{ReplicatorConfig, SourceClusterConfig};
//!
//! let config = ReplicatorConfig {
//!     cluster_name: "standby".into(),
//!     source_clusters: vec![SourceClusterConfig::for_testing("active")],
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── cluster_name: String             # This cluster's name
//! ├── settings: ReplicatorSettings
//! │   ├── workers: WorkerConfig        # Shards, queue sizes, backpressure
//! │   ├── retry: TaskRetryConfig       # Per-task retry budget
//! │   ├── source: SourceConfig         # Pull batch size, polling, rate limit
//! │   └── slo: SloConfig               # SLO thresholds
//! ├── source_clusters: Vec<SourceClusterConfig>
//! ├── dlq: DlqConfig                   # SQLite DLQ
//! └── cursor: CursorConfig             # SQLite ack levels
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! cluster_name: "standby-eu"
//!
//! settings:
//!   workers:
//!     count: 8
//!     send_timeout: "250ms"
//!   retry:
//!     max_attempts: 5
//!     initial_delay: "100ms"
//!   source:
//!     batch_size: 100
//!     poll_interval: "1s"
//!     redis_url: "redis://replication:6379"
//!
//! source_clusters:
//!   - name: "active-us"
//!
//! dlq:
//!   sqlite_path: "/var/lib/replicator/dlq.db"
//! cursor:
//!   sqlite_path: "/var/lib/replicator/acks.db"
//!   flush_interval: "1s"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Name of the local cluster. Tasks are never pulled from it.
    pub cluster_name: String,

    #[serde(default)]
    pub settings: ReplicatorSettings,

    /// Remote clusters to replicate from.
    #[serde(default)]
    pub source_clusters: Vec<SourceClusterConfig>,

    #[serde(default)]
    pub dlq: DlqConfig,

    #[serde(default)]
    pub cursor: CursorConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            cluster_name: "local".to_string(),
            settings: ReplicatorSettings::default(),
            source_clusters: Vec::new(),
            dlq: DlqConfig::default(),
            cursor: CursorConfig::default(),
        }
    }
}

impl ReplicatorConfig {
    /// In-memory stores, fast retries, short timeouts.
    pub fn for_testing(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            settings: ReplicatorSettings::for_testing(),
            source_clusters: Vec::new(),
            dlq: DlqConfig::in_memory(),
            cursor: CursorConfig::in_memory(),
        }
    }

    /// Enabled source clusters, excluding the local one.
    pub fn active_sources(&self) -> impl Iterator<Item = &SourceClusterConfig> {
        self.source_clusters
            .iter()
            .filter(move |s| s.enabled && s.name != self.cluster_name)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(ReplicationError::Config("cluster_name is empty".into()));
        }
        if self.settings.workers.count == 0 {
            return Err(ReplicationError::Config("workers.count must be positive".into()));
        }
        if self.settings.workers.queue_capacity == 0 {
            return Err(ReplicationError::Config(
                "workers.queue_capacity must be positive".into(),
            ));
        }
        if self.settings.source.batch_size == 0 {
            return Err(ReplicationError::Config("source.batch_size must be positive".into()));
        }
        if self.settings.retry.max_attempts == 0 {
            return Err(ReplicationError::Config("retry.max_attempts must be positive".into()));
        }
        if self.dlq.page_size < 1 {
            return Err(ReplicationError::Config("dlq.page_size must be positive".into()));
        }
        let mut seen = HashSet::new();
        for source in &self.source_clusters {
            if source.name.is_empty() {
                return Err(ReplicationError::Config("source cluster with empty name".into()));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ReplicationError::Config(format!(
                    "source cluster '{}' listed twice",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatorSettings {
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub retry: TaskRetryConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub slo: SloConfig,
}

impl ReplicatorSettings {
    pub fn for_testing() -> Self {
        Self {
            workers: WorkerConfig::for_testing(),
            retry: TaskRetryConfig::for_testing(),
            source: SourceConfig::for_testing(),
            slo: SloConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WorkerConfig: shard pool and backpressure
// ═══════════════════════════════════════════════════════════════════════════════

/// Worker pool configuration.
///
/// Each worker owns one bounded queue; a run always hashes to the same worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Tasks buffered per worker before pullers block.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a puller waits on a full queue before rewinding and pausing.
    #[serde(default = "default_send_timeout")]
    pub send_timeout: String,

    /// Pause after a backpressure rewind.
    #[serde(default = "default_backpressure_pause")]
    pub backpressure_pause: String,
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_send_timeout() -> String {
    "250ms".to_string()
}

fn default_backpressure_pause() -> String {
    "100ms".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            send_timeout: default_send_timeout(),
            backpressure_pause: default_backpressure_pause(),
        }
    }
}

impl WorkerConfig {
    pub fn for_testing() -> Self {
        Self {
            count: 2,
            queue_capacity: 16,
            send_timeout: "50ms".to_string(),
            backpressure_pause: "10ms".to_string(),
        }
    }

    pub fn send_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.send_timeout, Duration::from_millis(250))
    }

    pub fn backpressure_pause_duration(&self) -> Duration {
        parse_duration_or(&self.backpressure_pause, Duration::from_millis(100))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TaskRetryConfig: per-task retry budget
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry budget for retryable task failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRetryConfig {
    /// Attempts including the first, before the task goes to the DLQ.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Full-range jitter on every delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_delay() -> String {
    "100ms".to_string()
}

fn default_max_delay() -> String {
    "10s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for TaskRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: true,
        }
    }
}

impl TaskRetryConfig {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    /// Resolve into a [`RetryConfig`]. Unparseable durations fall back to
    /// the defaults.
    pub fn to_retry_config(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: parse_duration_or(&self.initial_delay, defaults.initial_delay),
            max_delay: parse_duration_or(&self.max_delay, defaults.max_delay),
            backoff_factor: if self.backoff_factor >= 1.0 {
                self.backoff_factor
            } else {
                defaults.backoff_factor
            },
            jitter: self.jitter,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: pulling from remote clusters
// ═══════════════════════════════════════════════════════════════════════════════

/// Task pulling configuration, shared by all source clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Maximum tasks per pull.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Wait between pulls once caught up.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Redis URL for [`RedisTaskSource`](crate::source::RedisTaskSource).
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Key prefix for replication streams and backfill histories.
    #[serde(default)]
    pub redis_prefix: String,

    /// Timeout for a single Redis command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained tasks per second across all sources.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_command_timeout() -> String {
    "5s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
            redis_url: None,
            redis_prefix: String::new(),
            command_timeout: default_command_timeout(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl SourceConfig {
    pub fn for_testing() -> Self {
        Self {
            batch_size: 10,
            poll_interval: "10ms".to_string(),
            ..Default::default()
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_secs(1))
    }

    pub fn command_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.command_timeout, Duration::from_secs(5))
    }

    /// `None` when rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SLO thresholds. Violations are logged and counted, nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    #[serde(default = "default_max_pull_latency_ms")]
    pub max_pull_latency_ms: u64,

    /// Applies to one successful attempt, backfill included.
    #[serde(default = "default_max_apply_latency_ms")]
    pub max_apply_latency_ms: u64,
}

fn default_max_pull_latency_ms() -> u64 {
    500
}

fn default_max_apply_latency_ms() -> u64 {
    1000
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_pull_latency_ms: default_max_pull_latency_ms(),
            max_apply_latency_ms: default_max_apply_latency_ms(),
        }
    }
}

impl SloConfig {
    pub fn is_pull_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_pull_latency_ms
    }

    pub fn is_apply_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_apply_latency_ms
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceClusterConfig: one entry per remote cluster
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceClusterConfig {
    pub name: String,

    /// Disabled sources are neither pulled nor restored.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourceClusterConfig {
    pub fn for_testing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DlqConfig / CursorConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Dead-letter queue persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Default page size for DLQ reads and merges.
    #[serde(default = "default_dlq_page_size")]
    pub page_size: i64,
}

fn default_dlq_page_size() -> i64 {
    crate::dlq::manager::DEFAULT_PAGE_SIZE
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_dlq.db".to_string(),
            wal_mode: true,
            page_size: default_dlq_page_size(),
        }
    }
}

impl DlqConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: crate::sqlite::IN_MEMORY.to_string(),
            wal_mode: false,
            page_size: default_dlq_page_size(),
        }
    }
}

/// Ack level persistence.
///
/// Ack levels are debounced in memory and flushed every `flush_interval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,

    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_flush_interval() -> String {
    "1s".to_string()
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_acks.db".to_string(),
            wal_mode: true,
            flush_interval: default_flush_interval(),
        }
    }
}

impl CursorConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: crate::sqlite::IN_MEMORY.to_string(),
            wal_mode: false,
            flush_interval: "50ms".to_string(),
        }
    }

    pub fn flush_interval_duration(&self) -> Duration {
        parse_duration_or(&self.flush_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_parsing_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = WorkerConfig {
                send_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.send_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_durations_fall_back() {
        let cursor = CursorConfig {
            flush_interval: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(cursor.flush_interval_duration(), Duration::from_secs(1));

        let source = SourceConfig {
            poll_interval: "".to_string(),
            ..Default::default()
        };
        assert_eq!(source.poll_interval_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_config_resolution() {
        let retry = TaskRetryConfig {
            max_attempts: 7,
            initial_delay: "20ms".to_string(),
            max_delay: "bogus".to_string(),
            backoff_factor: 0.5,
            jitter: false,
        }
        .to_retry_config();

        assert_eq!(retry.max_attempts, 7);
        assert_eq!(retry.initial_delay, Duration::from_millis(20));
        assert_eq!(retry.max_delay, RetryConfig::default().max_delay);
        assert_eq!(retry.backoff_factor, 2.0);
        assert!(!retry.jitter);
    }

    #[test]
    fn test_rate_limit_config() {
        let mut config = SourceConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 5000;
        config.rate_limit_burst = 500;
        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 5000);
        assert_eq!(rate.burst_size, 500);
    }

    #[test]
    fn test_slo_violations() {
        let slo = SloConfig::default();
        assert!(!slo.is_pull_violation(Duration::from_millis(500)));
        assert!(slo.is_pull_violation(Duration::from_millis(501)));
        assert!(!slo.is_apply_violation(Duration::from_millis(1000)));
        assert!(slo.is_apply_violation(Duration::from_secs(2)));
    }

    #[test]
    fn test_active_sources_skip_local_and_disabled() {
        let mut config = ReplicatorConfig::for_testing("standby");
        config.source_clusters = vec![
            SourceClusterConfig::for_testing("active"),
            SourceClusterConfig::for_testing("standby"),
            SourceClusterConfig {
                name: "paused".to_string(),
                enabled: false,
            },
        ];
        let names: Vec<&str> = config.active_sources().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["active"]);
    }

    #[test]
    fn test_validate() {
        let mut config = ReplicatorConfig::for_testing("standby");
        config.source_clusters = vec![SourceClusterConfig::for_testing("active")];
        assert!(config.validate().is_ok());

        config.source_clusters.push(SourceClusterConfig::for_testing("active"));
        assert!(config.validate().is_err());

        let mut config = ReplicatorConfig::for_testing("standby");
        config.settings.workers.count = 0;
        assert!(config.validate().is_err());

        let mut config = ReplicatorConfig::for_testing("standby");
        config.dlq.page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_for_testing_uses_in_memory_stores() {
        let config = ReplicatorConfig::for_testing("standby");
        assert_eq!(config.dlq.sqlite_path, ":memory:");
        assert_eq!(config.cursor.sqlite_path, ":memory:");
        assert!(!config.settings.retry.jitter);
    }

    #[test]
    fn test_config_json_defaults() {
        let json = r#"{
            "cluster_name": "standby",
            "source_clusters": [{"name": "active"}],
            "settings": {"workers": {"count": 8}}
        }"#;
        let parsed: ReplicatorConfig = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.cluster_name, "standby");
        assert_eq!(parsed.settings.workers.count, 8);
        assert_eq!(parsed.settings.workers.queue_capacity, 256);
        assert_eq!(parsed.settings.retry.max_attempts, 5);
        assert!(parsed.source_clusters[0].enabled);
        assert_eq!(parsed.dlq.page_size, 100);
        assert_eq!(parsed.cursor.flush_interval, "1s");
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = ReplicatorConfig::for_testing("standby");
        config.source_clusters = vec![
            SourceClusterConfig::for_testing("active-1"),
            SourceClusterConfig::for_testing("active-2"),
        ];

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicatorConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.cluster_name, "standby");
        assert_eq!(parsed.source_clusters.len(), 2);
        assert_eq!(parsed.source_clusters[1].name, "active-2");
        assert_eq!(parsed.settings.workers.count, 2);
    }
}
