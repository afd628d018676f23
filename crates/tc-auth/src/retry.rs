use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::errors::{AuthError, Result};

/// Run `future` unless `cancellation` fires first
pub(crate) async fn cancellable<F, T>(
    cancellation: Option<&CancellationToken>,
    future: F,
) -> Result<T>
where
    F: Future<Output = T>,
{
    match cancellation {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(AuthError::Cancelled),
            value = future => Ok(value),
        },
        None => Ok(future.await),
    }
}

/// Run `operation` under `policy`
///
/// Terminal errors return at once. Between attempts the policy delay elapses and
/// `before_retry` runs, typically marking the upstream cache slots stale. When
/// every attempt fails the last error is returned unchanged.
pub async fn retry<T, Op, OpFut, Before, BeforeFut>(
    policy: &RetryPolicy,
    step: &str,
    cancellation: Option<&CancellationToken>,
    mut operation: Op,
    mut before_retry: Before,
) -> Result<T>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T>>,
    Before: FnMut() -> BeforeFut,
    BeforeFut: Future<Output = Result<()>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                debug!("{} failed with a terminal error", step);
                return Err(e);
            }
            Err(e) if attempt >= attempts => {
                warn!("{} failed after {} attempts: {}", step, attempt, e);
                return Err(e);
            }
            Err(e) => {
                warn!("{} failed (attempt {}/{}), retrying: {}", step, attempt, attempts, e);
                cancellable(cancellation, tokio::time::sleep(policy.delay)).await?;
                before_retry().await?;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn transient() -> AuthError {
        AuthError::invalid_response("test", "malformed")
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(2000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_after_refresh() {
        let calls = AtomicU32::new(0);
        let refreshes = AtomicU32::new(0);

        let started = tokio::time::Instant::now();
        let value = retry(
            &policy(),
            "test",
            None,
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            },
            || async {
                refreshes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(
            &policy(),
            "test",
            None,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AuthError::TwoFactorRequired)
            },
            || async { Ok::<(), AuthError>(()) },
        )
        .await;

        assert!(matches!(result, Err(AuthError::TwoFactorRequired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(
            &policy(),
            "test",
            None,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(AuthError::invalid_response("test", format!("attempt {n}")))
            },
            || async { Ok::<(), AuthError>(()) },
        )
        .await;

        let error = result.unwrap_err();
        assert!(error.to_string().contains("attempt 1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_delay() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = retry(
            &policy(),
            "test",
            Some(&token),
            || async { Err(transient()) },
            || async { Ok::<(), AuthError>(()) },
        )
        .await;
        assert!(matches!(result, Err(AuthError::Cancelled)));
    }
}
