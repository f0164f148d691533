//! Bounded retry and backoff.
//!
//! [`Backoff`] is a capped exponential schedule with optional jitter, shared
//! by store writes and the instrumentation bridge's attach loop.
//! [`RetryPolicy`] bounds the number of attempts for a single operation.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{Result, StorageError};

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff that starts at `initial` and doubles up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: 0.0,
            current: initial,
        }
    }

    /// Spreads each delay uniformly by `±fraction` (clamped to 0..=1).
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            base.mul_f64(factor).min(self.max)
        } else {
            base
        }
    }

    /// Restarts the schedule from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How many times, and how patiently, to retry a store write.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Transient failures are retried after a blocking sleep; callers on an
    /// async runtime should run this on a blocking thread. Exhausting the
    /// attempts yields [`StorageError::Unavailable`].
    pub fn run<T>(&self, operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut backoff = Backoff::new(self.initial_delay, self.max_delay);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = backoff.next_delay();
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store error, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) if e.is_transient() => {
                    return Err(StorageError::Unavailable {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
