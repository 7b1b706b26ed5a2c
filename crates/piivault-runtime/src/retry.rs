//! Bounded retry for idempotent reads.
//!
//! Only errors reporting themselves transient (`Unavailable`) are retried,
//! and never past the request deadline. Writes are not routed through here.

use std::time::Duration;

use tracing::warn;

use piivault_core::{Deadline, Result};

/// Delay schedule between attempts.
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// No retry
    None,
    /// Fixed delay between retries
    Fixed { delay: Duration },
    /// Exponential backoff
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed { delay } => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                initial_delay.mul_f64(factor).min(*max_delay)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    pub fn reads(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::default(),
        }
    }

    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            strategy: RetryStrategy::None,
        }
    }

    /// Run `op`, retrying transient failures while attempts and deadline allow.
    pub fn run<T>(
        &self,
        deadline: &Deadline,
        what: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.strategy.delay_for_attempt(attempt);
                    if matches!(deadline.remaining(), Some(left) if left <= delay) {
                        return Err(e);
                    }
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.max_attempts, delay, e
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
