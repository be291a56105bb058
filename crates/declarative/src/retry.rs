//! Retry with exponential backoff for transient provisioning errors

use crate::backend::ProvisionError;
use crate::context::CancelToken;
use std::time::{Duration, Instant};

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Self::default()
        }
    }

    /// Delay after the given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Callback for retry notifications
pub trait RetryCallback {
    /// `attempt` is 1-indexed
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ProvisionError, delay: Duration);
}

/// Logs each retry at `warn` level
pub struct LogCallback<'a> {
    pub resource: &'a str,
}

impl RetryCallback for LogCallback<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ProvisionError, delay: Duration) {
        log::warn!(
            "{}: attempt {attempt}/{max_attempts} failed: {error}. Retrying in {}ms",
            self.resource,
            delay.as_millis()
        );
    }
}

/// Run `operation` until it succeeds, fails permanently or the budget runs out
///
/// The operation receives the 0-indexed attempt number. Backoff waits are
/// cut short by `cancel` and never extend past `deadline`.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    cancel: &CancelToken,
    deadline: Option<Instant>,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T, ProvisionError>
where
    F: FnMut(u32) -> Result<T, ProvisionError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        let error = match operation(attempt) {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt + 1 >= max_attempts {
            return Err(error);
        }

        let delay = config.delay_for_attempt(attempt);
        if let Some(deadline) = deadline
            && Instant::now() + delay >= deadline
        {
            return Err(error);
        }

        if let Some(cb) = callback {
            cb.on_retry(attempt + 1, max_attempts, &error, delay);
        }

        if !cancel.sleep(delay) {
            return Err(ProvisionError::Cancelled);
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig::new(5, Duration::from_secs(2), 2.0);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_permanent_error_is_not_retried() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), &CancelToken::new(), None, None, |_| {
            attempts.set(attempts.get() + 1);
            Err(ProvisionError::permanent("invalid"))
        });
        assert_eq!(result, Err(ProvisionError::permanent("invalid")));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_transient_error_eventually_succeeds() {
        let result = with_retry(&fast(), &CancelToken::new(), None, None, |attempt| {
            if attempt < 2 {
                Err(ProvisionError::transient("throttled"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn test_budget_exhausted_returns_last_error() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), &CancelToken::new(), None, None, |_| {
            attempts.set(attempts.get() + 1);
            Err(ProvisionError::transient("throttled"))
        });
        assert!(matches!(result, Err(ProvisionError::Transient { .. })));
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_callback_invoked_between_attempts() {
        struct Counting(Arc<AtomicU32>);
        impl RetryCallback for Counting {
            fn on_retry(&self, _: u32, _: u32, _: &ProvisionError, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let callback = Counting(count.clone());
        let _: Result<(), _> =
            with_retry(&fast(), &CancelToken::new(), None, Some(&callback), |_| {
                Err(ProvisionError::transient("throttled"))
            });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancelled_before_first_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            with_retry(&fast(), &cancel, None, None, |_| panic!("must not run"));
        assert_eq!(result, Err(ProvisionError::Cancelled));
    }

    #[test]
    fn test_deadline_stops_backoff() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(5),
        };
        let deadline = Instant::now() + Duration::from_millis(100);
        let attempts = Cell::new(0);
        let result: Result<(), _> =
            with_retry(&config, &CancelToken::new(), Some(deadline), None, |_| {
                attempts.set(attempts.get() + 1);
                Err(ProvisionError::transient("throttled"))
            });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }
}
