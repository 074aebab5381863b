//! Bounded polling and retry primitives.
//!
//! Two flavors of waiting live here:
//!
//! - [`poll_until`] waits for the cluster to converge. It calls a check a
//!   fixed number of times at a fixed interval and gives up with
//!   [`Error::Timeout`]. Errors returned by the check are NOT retried; a check
//!   that wants to tolerate transient API failures must swallow them itself and
//!   report "not yet".
//! - [`retry_with_backoff`] retries a single failing call with exponential
//!   backoff and jitter, for at-least-once delivery of idempotent writes.
//!
//! # Example
//!
//! ```ignore
//! use stratum_common::retry::{poll_until, PollPolicy};
//!
//! let ip = poll_until(&PollPolicy::new(10, Duration::from_secs(10)), "load balancer ip", || async {
//!     client.load_balancer_address("ns1", "webserver-lb").await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::duration_secs;
use crate::Error;

/// How often and how many times a readiness check is attempted.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollPolicy {
    /// Maximum number of times the check runs
    pub max_attempts: u32,
    /// Sleep between consecutive checks
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl PollPolicy {
    /// Create a policy with the given bound and interval
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Policy that checks `max_attempts` times without sleeping (tests, dry runs)
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Upper bound on how long a poll with this policy can block
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Poll `check` until it yields a value or the attempt bound is reached.
///
/// `check` returns `Ok(Some(value))` when the condition holds, `Ok(None)` to
/// keep polling, and `Err` to abort immediately. The interval is slept between
/// attempts only, so `PollPolicy::immediate(3)` with a never-ready check
/// returns [`Error::Timeout`] after exactly three calls. A `max_attempts` of
/// zero still runs the check once.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    operation: &str,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if let Some(value) = check().await? {
            debug!(operation, attempt, "condition met");
            return Ok(value);
        }

        debug!(operation, attempt, max_attempts, "condition not yet met");
        if attempt < max_attempts && !policy.interval.is_zero() {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(Error::timeout(operation, max_attempts))
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but errors rejected by `should_retry` are
/// returned immediately.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    debug!(operation = %operation_name, attempt, error = %e, "error is not retryable");
                    return Err(e);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn never_ready_check_times_out_after_exact_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), Error> = poll_until(&PollPolicy::immediate(3), "never", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_first_ready_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poll_until(&PollPolicy::immediate(10), "third time", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n == 3 { Some(n * 10) } else { None })
            }
        })
        .await;

        assert_eq!(result.unwrap(), 30);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn check_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<String, Error> = poll_until(&PollPolicy::immediate(5), "pods", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::platform("list_pods", "connection refused"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_platform());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_checks_once() {
        let result = poll_until(&PollPolicy::immediate(0), "once", || async {
            Ok(Some("ready"))
        })
        .await;
        assert_eq!(result.unwrap(), "ready");
    }

    #[test]
    fn budget_excludes_trailing_sleep() {
        let policy = PollPolicy::new(10, Duration::from_secs(10));
        assert_eq!(policy.budget(), Duration::from_secs(90));
        assert_eq!(PollPolicy::immediate(0).budget(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        };

        let result: Result<u32, String> = retry_with_backoff(&config, "apply", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        };

        let result: Result<(), &str> = retry_with_backoff(&config, "apply", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("still failing")
            }
        })
        .await;

        assert_eq!(result, Err("still failing"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_manifests_fail_fast() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        };

        let result: Result<(), Error> =
            retry_with_backoff_if(&config, "apply", Error::is_retryable, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "Deployment.apps \"webserver\" is invalid".to_string(),
                        reason: "Invalid".to_string(),
                        code: 422,
                    })))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_use_every_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        };

        let result: Result<(), Error> =
            retry_with_backoff_if(&config, "apply", Error::is_retryable, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::platform("apply", "connection reset"))
                }
            })
            .await;

        assert!(result.unwrap_err().is_platform());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
