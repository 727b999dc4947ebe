use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// What a classifier decided about a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Stop,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Classified as not worth retrying.
    Fatal(E),
    /// Still retryable after the last allowed attempt.
    AttemptsExceeded { error: E, attempts: usize },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::AttemptsExceeded { error, .. } => error,
        }
    }
}

/// Bounded exponential backoff. `max_attempts` counts the first try.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() {
                base_delay
            } else {
                max_delay
            },
        }
    }

    /// Preset for sink inserts over HTTP.
    pub fn for_sink() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Retries without sleeping.
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Runs `op` until it succeeds, `classify` says stop, or the attempts
    /// run out. `op` gets the zero-based attempt number.
    pub async fn run<F, Fut, T, E, C>(&self, mut op: F, classify: C) -> Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDisposition,
    {
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if classify(&err) == RetryDisposition::Stop {
                return Err(RetryError::Fatal(err));
            }

            attempt += 1;
            if attempt >= self.max_attempts {
                return Err(RetryError::AttemptsExceeded {
                    error: err,
                    attempts: attempt,
                });
            }

            let delay = self.backoff_delay(attempt - 1);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying");
            sleep(delay).await;
        }
    }

    /// `base_delay * 2^attempt`, doubling at most six times, capped at
    /// `max_delay`.
    fn backoff_delay(&self, attempt: usize) -> Duration {
        let doubled = self
            .base_delay
            .checked_mul(1 << attempt.min(6))
            .unwrap_or(self.max_delay);
        doubled.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), _> = policy
            .run(|_| async { Err::<(), _>("boom") }, |_| RetryDisposition::Retry)
            .await;
        match result {
            Err(RetryError::AttemptsExceeded { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let mut seen = Vec::new();
        let result: Result<(), _> = policy
            .run(
                |attempt| {
                    seen.push(attempt);
                    async { Err::<(), _>("fatal") }
                },
                |_| RetryDisposition::Stop,
            )
            .await;
        assert!(matches!(result, Err(RetryError::Fatal("fatal"))));
        assert_eq!(seen, vec![0]);
    }

    #[tokio::test]
    async fn succeeds_on_a_later_attempt() {
        let policy = RetryPolicy::immediate(4);
        let result = policy
            .run(
                |attempt| async move { if attempt < 2 { Err("transient") } else { Ok(attempt) } },
                |_| RetryDisposition::Retry,
            )
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(500));
    }
}
