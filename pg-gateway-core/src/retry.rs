//! C7 — Retry Decorators.
//!
//! Rust has no decorator syntax, so each wrapper is a plain async function
//! taking the operation as a closure, mirroring the shape
//! `pg_mcp_server/utils/retry.py`'s decorators reduce to once unwrapped.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Runs `op` until it succeeds, a non-retryable error is returned, or
/// `attempts` is exhausted. The final attempt's error propagates unchanged.
async fn retry_with<T, E, Fut>(
    attempts: u32,
    mut delay: Duration,
    backoff: f64,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= attempts || !is_retryable(&e) {
                    return Err(e);
                }
                warn!(
                    label,
                    attempt, attempts, error = %e, "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * backoff);
            }
        }
    }
}

/// Timeout retry: default 3 attempts, 1.0s initial delay, 2.0x backoff.
pub async fn retry_on_timeout<T, E, Fut>(
    is_retryable: impl Fn(&E) -> bool,
    op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with(
        3,
        Duration::from_secs_f64(1.0),
        2.0,
        "timeout",
        is_retryable,
        op,
    )
    .await
}

/// API retry: default 3 attempts, 2.0s initial delay, 2.0x backoff.
pub async fn retry_on_api_error<T, E, Fut>(
    is_retryable: impl Fn(&E) -> bool,
    op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with(
        3,
        Duration::from_secs_f64(2.0),
        2.0,
        "api",
        is_retryable,
        op,
    )
    .await
}

/// DB retry: default 2 attempts, fixed 1.0s delay (no multiplier).
pub async fn retry_on_db_error<T, E, Fut>(
    is_retryable: impl Fn(&E) -> bool,
    op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with(
        2,
        Duration::from_secs_f64(1.0),
        1.0,
        "db",
        is_retryable,
        op,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_on_db_error(
            |_: &&str| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err("connection lost")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_on_db_error(
            |_: &&str| false,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err("fatal") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
