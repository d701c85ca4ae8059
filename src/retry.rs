//! Bounded retry with exponential backoff and jitter
//!
//! Used by the OIDC authenticator to ride out transient JWKS fetch
//! failures. Per-request proxy traffic is never retried here; retrying a
//! proxied call is the client's responsibility.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Backoff schedule for a transient operation
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Total attempts before giving up (must be at least 1)
    pub attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run `operation` until it succeeds or the schedule is exhausted.
///
/// Each failed attempt doubles the delay, capped at `max_delay`, with a
/// 0.5x–1.5x jitter so concurrent callers spread out. Returns the last
/// error when every attempt fails.
pub async fn with_backoff<F, Fut, T, E>(
    schedule: &Backoff,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = schedule.base_delay;

    for attempt in 1..=schedule.attempts.max(1) {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt == schedule.attempts.max(1) => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "giving up after final attempt"
                );
                return Err(e);
            }
            Err(e) => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis(),
                    "transient failure, backing off"
                );

                tokio::time::sleep(sleep_for).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * 2.0).min(schedule.max_delay.as_secs_f64()),
                );
            }
        }
    }

    unreachable!("loop returns on final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_schedule(attempts: u32) -> Backoff {
        Backoff {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success_does_not_sleep() {
        let result: Result<u32, &str> =
            with_backoff(&fast_schedule(3), "jwks", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<u32, &str> = with_backoff(&fast_schedule(5), "jwks", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection reset")
                } else {
                    Ok(1)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<u32, String> = with_backoff(&fast_schedule(3), "jwks", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {}", n))
            }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_clamps_to_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<u32, &str> = with_backoff(&fast_schedule(0), "jwks", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
