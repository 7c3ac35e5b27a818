//! Generic retry policy built on `backon`'s exponential backoff, used
//! anywhere a transient failure should be retried rather than propagated —
//! broker publish attempts, relay passes, saga compensation commands.
//!
//! `backon` already implements exponential backoff with jitter, composably
//! via `.retry()` on any `Future`, so this is a thin named-defaults wrapper
//! rather than a reimplementation.

use std::time::Duration;

use backon::ExponentialBuilder;

/// A retry policy: exponential backoff from `base_delay`, capped at
/// `max_delay`, giving up after `max_retries` attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
            max_retries: 10,
        }
    }
}

impl RetryPolicy {
    /// Retry policy for saga command/compensation redelivery: slower cap,
    /// same ten-attempt budget as the compensation-retry policy it backs.
    pub fn for_saga_commands() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            max_retries: 10,
        }
    }

    /// The `backon` builder callers schedule retries with, e.g.
    /// `operation.retry(policy.backoff()).await`.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize)
    }
}

#[cfg(test)]
mod tests;
