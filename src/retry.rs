use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Exponential backoff starting at `base` and doubling per attempt, capped.
pub fn exponential_backoff(base: Duration, cap: Duration) -> impl Fn(u32) -> Duration {
    move |attempt| {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(cap)
    }
}

/// Run `op` up to `max_attempts` times, retrying only when `is_retryable`
/// says so, sleeping `backoff(attempt)` between attempts and invoking
/// `on_retry` before each re-attempt.
///
/// All VCS push/PR calls, check-waiter fetches and batch validator calls
/// funnel through here.
pub fn retry<T, F, P, B, H>(
    op_name: &str,
    max_attempts: u32,
    mut op: F,
    is_retryable: P,
    backoff: B,
    mut on_retry: H,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
    P: Fn(&Error) -> bool,
    B: Fn(u32) -> Duration,
    H: FnMut(u32, &Error),
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = backoff(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                on_retry(attempt, &e);
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shorthand for the common case: retry on `Error::is_retryable`, no hook.
pub fn retry_transient<T, F>(op_name: &str, max_attempts: u32, base: Duration, op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    retry(
        op_name,
        max_attempts,
        op,
        Error::is_retryable,
        exponential_backoff(base, Duration::from_secs(120)),
        |_, _| {},
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_succeeds_first_try() {
        let result = retry_transient("op", 3, Duration::from_millis(1), || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_retries_transient_then_succeeds() {
        let attempts = RefCell::new(0);
        let result = retry_transient("op", 3, Duration::from_millis(1), || {
            let mut a = attempts.borrow_mut();
            *a += 1;
            if *a < 3 {
                Err(Error::TaskSource("connection reset".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(*attempts.borrow(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let attempts = RefCell::new(0);
        let result: Result<()> = retry_transient("op", 3, Duration::from_millis(1), || {
            *attempts.borrow_mut() += 1;
            Err(Error::TaskSource("HTTP 503".into()))
        });
        assert!(result.is_err());
        assert_eq!(*attempts.borrow(), 3);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let attempts = RefCell::new(0);
        let result: Result<()> = retry_transient("op", 3, Duration::from_millis(1), || {
            *attempts.borrow_mut() += 1;
            Err(Error::TaskSource("HTTP 404 Not Found".into()))
        });
        assert!(result.is_err());
        assert_eq!(*attempts.borrow(), 1);
    }

    #[test]
    fn test_on_retry_hook_invoked() {
        let hooks = RefCell::new(Vec::new());
        let attempts = RefCell::new(0);
        let _: Result<()> = retry(
            "op",
            3,
            || {
                *attempts.borrow_mut() += 1;
                Err(Error::TaskSource("timeout".into()))
            },
            Error::is_retryable,
            |_| Duration::from_millis(1),
            |attempt, _| hooks.borrow_mut().push(attempt),
        );
        assert_eq!(*hooks.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = exponential_backoff(Duration::from_secs(15), Duration::from_secs(120));
        assert_eq!(backoff(1), Duration::from_secs(15));
        assert_eq!(backoff(2), Duration::from_secs(30));
        assert_eq!(backoff(3), Duration::from_secs(60));
        assert_eq!(backoff(4), Duration::from_secs(120));
        assert_eq!(backoff(10), Duration::from_secs(120));
    }
}
