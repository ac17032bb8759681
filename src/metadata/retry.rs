//! Retry of metadata mutations with exponential backoff

use crate::config::{GatewayConfig, MIN_TX_RETRY};
use crate::error::{Error, Result};
use std::time::Duration;
use tracing::warn;

/// Exponential backoff helper
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        ExponentialBackoff {
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_secs(2),
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Get the next delay, or None if max attempts reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }

        let delay = self.base_delay * 2u32.saturating_pow(self.current_attempt);
        self.current_attempt += 1;

        Some(delay.min(self.max_delay))
    }

    /// Reset the backoff
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Check if we have attempts remaining
    pub fn has_attempts(&self) -> bool {
        self.current_attempt < self.max_attempts
    }
}

/// How often and how patiently a mutation is retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay_ms: u64,
}

impl RetryPolicy {
    /// Policy with at least [`MIN_TX_RETRY`] attempts
    pub fn new(attempts: u32, base_delay_ms: u64) -> Self {
        RetryPolicy {
            attempts: attempts.max(MIN_TX_RETRY),
            base_delay_ms,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `f` until it succeeds, fails permanently, or the attempts run out
    pub fn run<T, F>(&self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        // one delay between each pair of attempts
        let mut backoff = ExponentialBackoff::new(self.base_delay_ms, self.attempts - 1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(op, attempt, error = %e, "retrying metadata mutation");
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    None => {
                        return Err(Error::RetriesExhausted {
                            op,
                            attempts: attempt,
                            source: Box::new(e),
                        })
                    }
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for RetryPolicy {
    fn from(config: &GatewayConfig) -> Self {
        RetryPolicy::new(config.tx_retry, config.retry_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(100, 3);

        let d1 = backoff.next_delay().unwrap();
        let d2 = backoff.next_delay().unwrap();
        let d3 = backoff.next_delay().unwrap();
        let d4 = backoff.next_delay();

        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(d2, Duration::from_millis(200));
        assert_eq!(d3, Duration::from_millis(400));
        assert!(d4.is_none());

        backoff.reset();
        assert!(backoff.has_attempts());
    }

    #[test]
    fn test_policy_floor() {
        assert_eq!(RetryPolicy::new(1, 0).attempts(), MIN_TX_RETRY);
        assert_eq!(RetryPolicy::new(5, 0).attempts(), 5);
    }

    #[test]
    fn test_transient_errors_retried_until_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3, 1);
        let value = policy
            .run("test", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(Error::Conflict("files".into()))
                } else {
                    Ok(42)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhausted_retries_surface() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3, 1);
        let err = policy
            .run::<(), _>("mark_file_released", || {
                calls.set(calls.get() + 1);
                Err(Error::Conflict("files".into()))
            })
            .unwrap_err();
        assert_eq!(calls.get(), 3);
        match err {
            Error::RetriesExhausted { op, attempts, .. } => {
                assert_eq!(op, "mark_file_released");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3, 1);
        let err = policy
            .run::<(), _>("find", || {
                calls.set(calls.get() + 1);
                Err(Error::NotFound("x".into()))
            })
            .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(matches!(err, Error::NotFound(_)));
    }
}
