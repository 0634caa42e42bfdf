//! Resilience utilities: retry backoff and rate limiting.
//!
//! - [`RetryConfig`]: exponential backoff for connecting and for reopening
//!   change streams after a failure
//! - [`RateLimiter`]: token bucket used to pace reconciliation inserts so a
//!   large backfill does not saturate the cloud cluster
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use mongo_bisync::resilience::{RateLimiter, RateLimitConfig};
//!
//! // At most 200 documents/sec with bursts of 200
//! let limiter = RateLimiter::new(RateLimitConfig { burst_size: 200, refill_rate: 200 });
//! limiter.acquire_many(50).await; // Blocks if over limit
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Retry sleeps [`RetryConfig::total_budget`] sums one by one.
const EXACT_SLEEPS: usize = 64;

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Backoff policy for connection attempts and stream restarts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts. `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Multiplier applied per attempt.
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for the initial connection at startup.
    ///
    /// Each ping is cut off after 10s, which is shorter than the driver's
    /// server-selection timeout, so an unreachable host fails within
    /// [`total_budget`](Self::total_budget), about 31.5s:
    ///
    /// ```text
    /// Attempt  Ping cap  Then sleep
    /// -------  --------  ----------
    /// 1        10s       500ms
    /// 2        10s       1s
    /// 3        10s       (give up)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs.max(0.0)), self.max_delay)
    }

    /// True when `attempt` (1-indexed) is still within budget.
    pub fn allows(&self, attempt: usize) -> bool {
        attempt <= self.max_attempts
    }

    /// Worst-case wall time for a full run of attempts: every attempt
    /// times out and every retry sleeps its full delay.
    ///
    /// Sleeps past the first 64 are counted at `max_delay`, so
    /// the result is an upper bound for any policy and exact for ours.
    pub fn total_budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let sleeps = attempts - 1;
        let exact = sleeps.min(EXACT_SLEEPS);
        let summed: Duration = (1..=exact).map(|a| self.delay_for_attempt(a)).sum();
        let capped = self.max_delay.saturating_mul(saturating_u32(sleeps - exact));
        self.connection_timeout
            .saturating_mul(saturating_u32(attempts))
            .saturating_add(summed)
            .saturating_add(capped)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket configuration.
///
/// Tokens refill at `refill_rate` per second up to `burst_size`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 ops/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let rate = NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire `n` permits one at a time. Cancel-safe.
    pub async fn acquire_many(&self, n: u32) {
        for _ in 0..n {
            self.limiter.until_ready().await;
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
