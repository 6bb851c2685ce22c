//! Retry backoff and pull rate limiting.
//!
//! - [`RetryConfig`]: exponential backoff policy. One preset per caller: task
//!   retries, source connects, the pull loop, DLQ writes.
//! - [`Backoff`]: a running failure streak over a [`RetryConfig`], reset on
//!   success.
//! - [`RateLimiter`]: token bucket bounding how many tasks per second the
//!   pullers hand to workers.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use history_replicator::resilience::{Backoff, RateLimiter, RateLimitConfig, RetryConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.admit_batch(250).await;
//!
//! let mut backoff = Backoff::new(RetryConfig::pull_errors());
//! let delay = backoff.fail();
//! assert!(delay <= backoff.config().max_delay);
//! backoff.reset();
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use std::num::NonZeroU32;
use std::time::Duration;

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first. `usize::MAX` never gives up.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    /// Ceiling for the exponential growth.
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Randomize each delay over `[0, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::task()
    }
}

impl RetryConfig {
    /// Retryable task failures: 5 attempts, 100ms doubling to 10s. After the
    /// last one the task is dead-lettered.
    pub fn task() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// Connecting to a source cluster's transport at startup.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        750ms
    /// 3        1.12s
    /// ...
    /// 10+      30s (capped)
    /// ```
    pub fn source_connect() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            jitter: false,
        }
    }

    /// Failed pulls. Pullers never give up on a source; the delay is capped
    /// at 5 minutes.
    pub fn pull_errors() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// DLQ writes. A dead-lettered task is only finished once its entry is
    /// stored, so the write is retried until shutdown.
    pub fn dlq_writes() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    /// Delay after the `attempt`-th failure (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) with full-range jitter
    /// when enabled.
    pub fn jittered_delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

/// A streak of consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.jittered_delay_for_attempt(self.failures)
    }

    /// Whether the streak has used up the attempt budget.
    pub fn exhausted(&self) -> bool {
        !self.config.allows_another(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket: `refill_rate` tasks per second, up to `burst_size` at once.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 1000 tasks/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Task admission limiter shared by all pullers of an engine.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    burst: NonZeroU32,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            limiter: GovLimiter::direct(quota),
            burst,
            config,
        }
    }

    /// Wait until `tasks` tasks may be handed to workers. Batches larger
    /// than the burst size are admitted one burst at a time.
    ///
    /// Cancel-safe: dropping the future gives back nothing already taken,
    /// but takes nothing more either.
    pub async fn admit_batch(&self, tasks: usize) {
        let mut remaining = tasks;
        while remaining > 0 {
            let chunk = remaining.min(self.burst.get() as usize);
            let Some(n) = NonZeroU32::new(chunk as u32) else {
                break;
            };
            // `n` never exceeds the burst, so capacity is always sufficient.
            if self.limiter.until_n_ready(n).await.is_err() {
                break;
            }
            remaining -= chunk;
        }
    }

    /// Take permits for `tasks` tasks if they are available right now.
    pub fn try_admit(&self, tasks: u32) -> bool {
        match NonZeroU32::new(tasks) {
            Some(n) => matches!(self.limiter.check_n(n), Ok(Ok(()))),
            None => true,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
