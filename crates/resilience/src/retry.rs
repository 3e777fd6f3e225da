use std::future::Future;

use crate::backoff::BackoffSchedule;

/// Bounds for a retry loop: total attempt count plus the delay schedule
/// applied between failed attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: BackoffSchedule,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delays_ms: Vec<u64>, jitter_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: BackoffSchedule::new(base_delays_ms, jitter_ms),
        }
    }
}

/// Run `body` up to `policy.attempts` times. A failure on the last attempt,
/// or one `should_retry` rejects, is returned to the caller. `on_retry` is
/// invoked before each sleep with the failing attempt number (1-based).
///
/// The sleep is a plain `tokio::time::sleep` await, so dropping the future
/// cancels the loop at any suspension point.
pub async fn retry<T, E, Fut>(
    policy: &RetryPolicy,
    mut should_retry: impl FnMut(&E, u32) -> bool,
    mut on_retry: impl FnMut(&E, u32),
    mut body: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    loop {
        match body().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.attempts || !should_retry(&err, attempt) {
                    return Err(err);
                }
                on_retry(&err, attempt);
                let delay = policy.backoff.delay_for((attempt - 1) as usize);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{retry, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, vec![1], 0)
    }

    #[tokio::test]
    async fn succeeds_without_retrying() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry(
            &quick_policy(3),
            |_, _| true,
            |_, _| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let retries = AtomicU32::new(0);
        let result: Result<u32, String> = retry(
            &quick_policy(5),
            |_, _| true,
            |_, _| {
                retries.fetch_add(1, Ordering::SeqCst);
            },
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("boom {n}"))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(
            &quick_policy(3),
            |_, _| true,
            |_, _| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("always") }
            },
        )
        .await;
        assert_eq!(result, Err("always"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(
            &quick_policy(5),
            |err, _| *err != "fatal",
            |_, _| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_retry_sees_attempt_numbers() {
        let seen = std::sync::Mutex::new(Vec::new());
        let result: Result<(), &str> = retry(
            &quick_policy(4),
            |_, attempt| {
                if let Ok(mut guard) = seen.lock() {
                    guard.push(attempt);
                }
                true
            },
            |_, _| {},
            || async { Err("nope") },
        )
        .await;
        assert!(result.is_err());
        let seen = match seen.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => panic!("mutex poisoned"),
        };
        // The final attempt returns without consulting the predicate.
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
