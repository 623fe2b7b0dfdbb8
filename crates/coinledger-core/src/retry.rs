use std::time::Duration;

use crate::error::LedgerError;

/// Bounded exponential backoff for transient backend failures.
///
/// `BackendUnavailable` is retried up to `max_attempts` and then surfaced
/// as `OperationFailed`; `PoolExhausted` is retried exactly once and then
/// surfaced as itself. Terminal errors pass through untouched.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        let max_attempts = max_attempts.max(1);
        let base_delay = base_delay.max(Duration::from_millis(1));
        let max_delay = max_delay.max(base_delay);
        Self { max_attempts, base_delay, max_delay }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn run<T, F>(&self, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Result<T, LedgerError>,
    {
        let mut attempt = 0u32;
        let mut pool_retried = false;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e @ LedgerError::PoolExhausted { .. }) => {
                    if pool_retried {
                        return Err(e);
                    }
                    pool_retried = true;
                    tracing::warn!(error = %e, "pool exhausted, retrying once");
                    std::thread::sleep(self.base_delay);
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(LedgerError::OperationFailed(e.to_string()));
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64,
                        "transient backend error, backing off");
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50), Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn new_clamps_inputs() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(1));
        assert_eq!(policy.max_delay, Duration::from_millis(1));
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(4));
        assert_eq!(policy.delay_for(0), Duration::from_millis(1));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4));
    }

    #[test]
    fn retries_transient_until_success() {
        let mut calls = 0;
        let result = fast().run(|| {
            calls += 1;
            if calls < 3 {
                Err(LedgerError::BackendUnavailable("down".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn exhausted_transient_becomes_operation_failed() {
        let mut calls = 0;
        let result: Result<(), _> = fast().run(|| {
            calls += 1;
            Err(LedgerError::BackendUnavailable("down".into()))
        });
        assert!(matches!(result.unwrap_err(), LedgerError::OperationFailed(_)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn pool_exhaustion_retried_once_then_surfaced() {
        let mut calls = 0;
        let result: Result<(), _> = fast().run(|| {
            calls += 1;
            Err(LedgerError::PoolExhausted { waited_ms: 1 })
        });
        assert!(matches!(result.unwrap_err(), LedgerError::PoolExhausted { .. }));
        assert_eq!(calls, 2);
    }

    #[test]
    fn terminal_errors_never_retry() {
        let mut calls = 0;
        let result: Result<(), _> = fast().run(|| {
            calls += 1;
            Err(LedgerError::InsufficientFunds { required: 10, available: 0 })
        });
        assert!(matches!(result.unwrap_err(), LedgerError::InsufficientFunds { .. }));
        assert_eq!(calls, 1);
    }
}
