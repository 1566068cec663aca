use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::retry as defaults;

/// Retry budget for provider requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first one
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::PROVIDER_MAX_RETRIES,
            base_delay_ms: defaults::PROVIDER_BASE_DELAY_MS,
            max_delay_ms: defaults::PROVIDER_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Errors that know whether another attempt may succeed
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;

    /// Server-suggested wait, honored instead of the computed backoff
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Returns `true` if the HTTP status code is transient and worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Exponential backoff with +/-25% jitter, capped at `max`.
///
/// `attempt` is zero-based: attempt 0 waits roughly `base`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    let exp_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max_ms);
    let jitter_range = exp_ms / 4;
    let jitter = if jitter_range > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_range * 2);
        offset as i64 - jitter_range as i64
    } else {
        0
    };
    let delay_ms = (exp_ms as i64 + jitter).max(0) as u64;
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    E: IsRetryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = e.retry_after().unwrap_or_else(|| {
                    backoff_delay(config.base_delay(), config.max_delay(), attempt)
                });
                attempt += 1;
                tracing::warn!(
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable: {})", self.retryable)
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_is_retryable_status() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        for status in [200, 400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(status));
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(5000);
        for _ in 0..20 {
            let d0 = backoff_delay(base, max, 0).as_millis();
            let d2 = backoff_delay(base, max, 2).as_millis();
            let d10 = backoff_delay(base, max, 10).as_millis();
            assert!((750..=1250).contains(&d0), "attempt 0: {d0}");
            assert!((3000..=5000).contains(&d2), "attempt 2: {d2}");
            assert!(d10 <= 5000, "attempt 10 exceeded cap: {d10}");
        }
    }

    #[test]
    fn test_backoff_no_overflow() {
        let delay = backoff_delay(Duration::from_secs(1), Duration::from_secs(60), 63);
        assert!(delay <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> = with_retry(&fast_config(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(TestError { retryable: true })
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = with_retry(&fast_config(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError { retryable: false })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = with_retry(&fast_config(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError { retryable: true })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
