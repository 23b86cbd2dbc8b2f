use crate::config::{BackoffKind, RetryConfig};
use backon::{BackoffBuilder, Retryable};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry policy shared by the download path and the crash loop.
///
/// Async operations go through [`RetryPolicy::run`], which drives `backon`.
/// Event-driven retries, where the next attempt is scheduled from a process
/// exit rather than awaited in place, ask [`RetryPolicy::delay_for`] directly.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
    backoff: BackoffKind,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.delay(),
            backoff: config.backoff,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based), or None once the budget is spent
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        match self.backoff {
            BackoffKind::Fixed => Some(self.delay),
            BackoffKind::Linear => Some(self.delay.saturating_mul(retry)),
        }
    }

    /// Run `operation`, retrying failures for which `retryable` holds
    pub async fn run<T, E, F, Fut, R>(&self, operation: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&E) -> bool,
        E: Display,
    {
        operation
            .retry(self.clone())
            .when(retryable)
            .notify(|error: &E, delay: Duration| {
                warn!(error = %error, delay_ms = delay.as_millis() as u64, "Attempt failed, retrying");
            })
            .await
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config)
    }
}

impl BackoffBuilder for RetryPolicy {
    type Backoff = RetryDelays;

    fn build(self) -> Self::Backoff {
        RetryDelays {
            policy: self,
            next_retry: 1,
        }
    }
}

/// Iterator of delays produced by a [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryDelays {
    policy: RetryPolicy,
    next_retry: u32,
}

impl Iterator for RetryDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.next_retry)?;
        self.next_retry += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_delays() {
        let policy = RetryPolicy::new(&RetryConfig::crash_loop());
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(4), None);
    }

    #[test]
    fn test_linear_delays() {
        let delays: Vec<_> = RetryPolicy::new(&RetryConfig::download()).build().collect();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[test]
    fn test_no_retry_yields_single_attempt() {
        let policy = RetryPolicy::new(&RetryConfig::no_retry());
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.build().next(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_retryable_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(&RetryConfig::download());

        let counter = attempts.clone();
        let result: Result<(), String> = policy
            .run(
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("connection reset".to_string())
                    }
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(&RetryConfig::download());

        let counter = attempts.clone();
        let result: Result<(), String> = policy
            .run(
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("404 not found".to_string())
                    }
                },
                |error: &String| !error.starts_with("404"),
            )
            .await;

        assert_eq!(result, Err("404 not found".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
