//! Bounded retry with pluggable backoff.
//!
//! Every remote call in the coordinator (queue, lease store, storage) goes
//! through [`Retry::run`], so transient failures are masked the same way
//! everywhere:
//!
//! - the operation is attempted up to `max_attempts` times
//! - between attempts the task sleeps for `backoff.delay(attempt)`
//! - the first success is returned immediately
//! - once attempts are exhausted the last error is returned unchanged
//!
//! Errors that are not [`Retryable`] (lock contention, malformed records) are
//! returned on the first attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

/// Decides whether a failed attempt is worth repeating.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for crate::Error {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Delay policy between attempts.
pub trait Backoff: Send + Sync {
    /// Delay to wait after the given failed attempt (1-indexed).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential growth capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            multiplier: 2.0,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// The same delay after every attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Retry immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Retry policy: attempt budget plus backoff.
#[derive(Clone)]
pub struct Retry {
    max_attempts: u32,
    backoff: Arc<dyn Backoff>,
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Retry {
    /// A policy making at most `max_attempts` calls. Zero is treated as one.
    pub fn new(max_attempts: u32, backoff: impl Backoff + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, NoBackoff)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails permanently, or the attempt
    /// budget runs out.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(attempts = attempt, error = %e, "Giving up after retries");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    debug!(attempt, ?delay, error = %e, "Attempt failed, backing off");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(3, ExponentialBackoff::default())
    }
}
