//! Bounded retry with exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            current: initial.min(max),
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn advance(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

/// How a session retries transient agent and sandbox failures.
///
/// The default performs no retries: transient errors are surfaced
/// immediately as error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    #[serde(default)]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between retries, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    /// A policy retrying up to `max_retries` times with default backoff.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::none()
        }
    }

    /// Sets the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// the retry budget is spent.
    ///
    /// `on_retry` is called with the attempt number and error before each
    /// backoff sleep.
    pub async fn run<T, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(u32, &crate::error::Error, Duration),
    {
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = backoff.current();
                    on_retry(attempt, &e, delay);
                    tokio::time::sleep(delay).await;
                    backoff.advance();
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(backoff.current(), Duration::from_millis(100));
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(200));
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_millis(300));
    }

    #[test]
    fn policy_loads_millisecond_backoff_from_toml() {
        let policy: RetryPolicy =
            toml::from_str("max_retries = 2\ninitial_backoff_ms = 250").unwrap();

        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_backoff_ms, 250);
        assert_eq!(policy.max_backoff_ms, 10_000);
    }

    #[test]
    fn with_backoff_stores_milliseconds() {
        let policy = RetryPolicy::with_max_retries(1)
            .with_backoff(Duration::from_millis(20), Duration::from_secs(2));

        assert_eq!(policy.initial_backoff_ms, 20);
        assert_eq!(policy.max_backoff_ms, 2_000);
    }

    #[test]
    fn default_policy_never_retries() {
        assert_eq!(RetryPolicy::default().max_retries, 0);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::with_max_retries(3)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        let mut retries = Vec::new();

        let value = policy
            .run(
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::BackendUnavailable("503".into()))
                    } else {
                        Ok(42)
                    }
                },
                |attempt, _, _| retries.push(attempt),
            )
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::with_max_retries(1)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1));

        let result: Result<()> = policy
            .run(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::ProvisionTimeout(1))
                },
                |_, _, _| {},
            )
            .await;

        assert!(matches!(result, Err(Error::ProvisionTimeout(1))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_quota_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::with_max_retries(5);

        let result: Result<()> = policy
            .run(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::QuotaExceeded("limit".into()))
                },
                |_, _, _| {},
            )
            .await;

        assert!(matches!(result, Err(Error::QuotaExceeded(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
