//! Resilience utilities: retry policy, byte-rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: fixed 30s supervisor schedule and SQLite busy backoff
//! - [`ByteRateLimiter`]: token bucket measured in bytes, used for cache uploads
//! - [`Bulkhead`]: semaphore bounding concurrent pushes
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), artifact_replication::resilience::BulkheadFull> {
//! use artifact_replication::resilience::{Bulkhead, ByteRateLimiter};
//!
//! // 1 MiB/s upload budget
//! if let Some(limiter) = ByteRateLimiter::new(1024 * 1024) {
//!     limiter.acquire_bytes(64 * 1024).await;
//! }
//!
//! // At most 8 pushes in flight
//! let bulkhead = Bulkhead::new(8);
//! let _permit = bulkhead.acquire().await?;
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Retry schedule.
///
/// Durations are interpreted by whoever sleeps, so a paused tokio clock
/// (`#[tokio::test(start_paused = true)]`) drives the whole schedule in tests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts allowed before giving up; `usize::MAX` retries forever.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    /// Ceiling for the backoff.
    pub max_delay: Duration,
    /// 1.0 keeps the interval fixed.
    pub backoff_factor: f64,
    /// Upper bound on a single attempt (cursor open, liveness ping).
    pub attempt_timeout: Duration,
}

impl RetryConfig {
    /// Retry forever, waiting the same `interval` between attempts.
    ///
    /// This is the tailer supervisor's schedule: a failed cursor
    /// registration is retried every 30 seconds until shutdown.
    pub fn fixed_interval(interval: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: interval,
            max_delay: interval,
            backoff_factor: 1.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }

    /// Short exponential retries for SQLite busy/locked errors.
    pub fn sqlite_busy() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent so huge attempt counts cannot overflow to inf/NaN.
        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() {
            return self.max_delay;
        }
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

// =============================================================================
// Byte-rate limiting
// =============================================================================

/// Token bucket where one token is one byte.
///
/// Upload streams call [`acquire_bytes`](Self::acquire_bytes) with each chunk's
/// length before yielding it. The bucket holds one second of budget, so a
/// chunk never has to wait longer than about a second.
pub struct ByteRateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    bytes_per_sec: NonZeroU32,
}

impl std::fmt::Debug for ByteRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRateLimiter")
            .field("bytes_per_sec", &self.bytes_per_sec)
            .finish()
    }
}

impl ByteRateLimiter {
    /// Create a limiter; `0` means unlimited and yields `None`.
    ///
    /// Rates above `u32::MAX` bytes/sec are clamped.
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        let clamped = u32::try_from(bytes_per_sec).unwrap_or(u32::MAX);
        let rate = NonZeroU32::new(clamped)?;
        let quota = Quota::per_second(rate).allow_burst(rate);
        Some(Self {
            limiter: GovLimiter::direct(quota),
            bytes_per_sec: rate,
        })
    }

    /// Configured rate.
    pub fn bytes_per_sec(&self) -> u32 {
        self.bytes_per_sec.get()
    }

    /// Largest chunk that fits the bucket in one request.
    pub fn max_chunk(&self) -> usize {
        self.bytes_per_sec.get() as usize
    }

    /// Wait until `n` bytes of budget are available and consume them.
    ///
    /// Requests larger than the bucket are split.
    pub async fn acquire_bytes(&self, n: usize) {
        let mut remaining = n;
        while remaining > 0 {
            let step = remaining.min(self.max_chunk());
            remaining -= step;
            let Some(cells) = NonZeroU32::new(step as u32) else {
                continue;
            };
            // `step` never exceeds the burst size, so InsufficientCapacity cannot occur.
            if self.limiter.until_n_ready(cells).await.is_err() {
                return;
            }
        }
    }

    /// Try to consume `n` bytes without waiting.
    pub fn try_acquire_bytes(&self, n: u32) -> bool {
        match NonZeroU32::new(n) {
            None => true,
            Some(cells) => matches!(self.limiter.check_n(cells), Ok(Ok(()))),
        }
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is full.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits concurrent operations.
///
/// The dispatcher shares one bulkhead across all cluster lanes so the total
/// number of pushes in flight stays bounded however many clusters exist.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the maximum concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Refuse further acquisitions; waiters get `BulkheadFull`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
