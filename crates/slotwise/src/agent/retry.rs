//! Bounded exponential backoff for network operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Backoff {
    /// Delay after the `attempt`-th failure (0-based): `base * 2^attempt`,
    /// capped at `max`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error seen.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = what,
                        attempt = attempt + 1,
                        of = attempts,
                        delay_ms = delay.as_millis(),
                        "{err}; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff {
            max_attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let b = backoff(5);
        assert_eq!(b.delay(0), Duration::from_millis(1));
        assert_eq!(b.delay(1), Duration::from_millis(2));
        assert_eq!(b.delay(2), Duration::from_millis(4));
        assert_eq!(b.delay(10), Duration::from_millis(4));
        assert_eq!(b.delay(40), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_retries_network_failures_until_success() {
        let calls = AtomicU32::new(0);
        let value = backoff(3)
            .retry("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::network("reset"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = backoff(3)
            .retry("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::network("down"))
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_other_errors() {
        let calls = AtomicU32::new(0);
        let err = backoff(5)
            .retry("resolve", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::ChannelUnknown {
                    channel: "x".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelUnknown { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
