//! Retry mechanisms for transient failures

use crate::{Error, Result};
use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub factor: f64,
    /// Jitter fraction applied to each delay
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Configuration from settings-level knobs
    pub fn new(max_attempts: u32, initial_delay: Duration, factor: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            factor,
            jitter: 0.1,
        }
    }

    /// Delay before the given retry (1-based attempt number)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base =
            self.initial_delay.as_nanos() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let base = base.min(self.max_delay.as_nanos() as f64);

        let jitter_range = base * self.jitter;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;

        Duration::from_nanos((base + jitter).max(0.0) as u64)
    }
}

/// Run an operation with exponential backoff on transient errors
///
/// Non-transient errors and exhausted attempts return the last error; the
/// operation name only feeds the retry log line.
pub async fn with_backoff<F, Fut, T>(name: &str, config: &BackoffConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if !error.is_transient() || attempt >= config.max_attempts {
                    return Err(error);
                }
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    operation = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, backing off"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Run a metadata write with retry-after-reread on revision conflicts
///
/// The closure is re-invoked after each conflict so the caller can reread the
/// current revision before retrying.
pub async fn with_conflict_retry<F, Fut, T>(name: &str, max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(Error::Conflict(reason)) if attempt < max_attempts => {
                tracing::debug!(operation = name, attempt, %reason, "revision conflict, rereading");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let config = BackoffConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let result = with_backoff("test", &config, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("try again"))
            } else {
                Ok(7u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_fatal() {
        let attempts = AtomicU32::new(0);
        let config = BackoffConfig::default();
        let result: Result<()> = with_backoff("test", &config, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::fatal("no"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let config = BackoffConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let result: Result<()> = with_backoff("test", &config, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("still down"))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = BackoffConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            factor: 2.0,
            jitter: 0.0,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(8), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_conflict_retry_rereads() {
        let attempts = AtomicU32::new(0);
        let result = with_conflict_retry("test", 3, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Conflict("stale".into()))
            } else {
                Ok(1u8)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
