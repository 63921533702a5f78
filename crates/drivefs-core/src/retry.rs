//! Bounded retry with configurable backoff.

use std::future::Future;
use std::time::Duration;

use drivefs_config::{BackoffStrategy, RetryConfig};
use tracing::warn;

use crate::error::DriveResult;

/// Compute the delay before retry number `attempt` (zero-based).
pub fn compute_backoff(base: Duration, attempt: u32, strategy: BackoffStrategy) -> Duration {
    match strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base * (attempt + 1),
        BackoffStrategy::Exponential => base * 2u32.saturating_pow(attempt),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub delay: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Single attempt, no delay.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        compute_backoff(self.delay, attempt, self.strategy)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. `op` receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> DriveResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DriveResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max = attempts,
                        error = %e,
                        "transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Retry policies for each class of remote call.
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    /// API POSTs and ranged reads.
    pub read: RetryPolicy,
    /// Single part PUTs.
    pub part: RetryPolicy,
    /// Renewal of expired part URLs.
    pub renew: RetryPolicy,
}

impl RetrySettings {
    pub fn from_config(config: &RetryConfig) -> Self {
        let policy = |attempts: u32, delay: Duration| RetryPolicy {
            attempts: attempts.max(1),
            delay,
            strategy: config.backoff,
        };
        RetrySettings {
            read: policy(config.read_attempts, config.read_delay.as_duration()),
            part: policy(config.part_attempts, config.part_delay.as_duration()),
            renew: policy(config.renew_attempts, config.renew_delay.as_duration()),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        RetrySettings {
            read: RetryPolicy::none(),
            part: RetryPolicy::none(),
            renew: RetryPolicy::none(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
