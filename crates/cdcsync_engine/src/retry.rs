//! Retry-until-success driver.

use crate::backoff::Backoff;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Attempts slower than this restart the backoff from its first interval.
const SLOW_ATTEMPT: Duration = Duration::from_secs(1);

/// Runs `operation` until it succeeds, fails fatally, or `cancel` fires.
///
/// The first attempt starts immediately. After a failed attempt `on_error`
/// is called and the next attempt waits for the backoff interval, unless
/// the failed attempt itself took longer than a second, in which case the
/// backoff is reset and the next attempt starts immediately.
///
/// Cancellation is observed before and during every attempt and every
/// wait. An interrupted attempt is dropped.
///
/// `Cancelled` and `Closed` from the operation end the loop without
/// calling `on_error`. Fatal errors end it after `on_error`.
pub async fn retry_until_success<T, F, Fut, E>(
    cancel: &CancellationToken,
    mut backoff: Backoff,
    mut operation: F,
    mut on_error: E,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
    E: FnMut(&SyncError),
{
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            outcome = operation() => outcome,
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.is_shutdown() {
            return Err(err);
        }
        on_error(&err);
        if err.is_fatal() {
            return Err(err);
        }

        if started.elapsed() > SLOW_ATTEMPT {
            backoff.reset();
            continue;
        }

        let wait = backoff.next();
        debug!(attempt = backoff.attempt_count(), ?wait, "retrying after backoff");
        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 2.0).without_jitter()
    }

    #[tokio::test]
    async fn returns_first_success() {
        let cancel = CancellationToken::new();
        let mut errors = 0;
        let value = retry_until_success(&cancel, fast(), || async { Ok(7) }, |_| errors += 1)
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(errors, 0);
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let mut errors = 0;
        let counter = calls.clone();
        let value = retry_until_success(
            &cancel,
            fast(),
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(SyncError::Timeout)
                    } else {
                        Ok("done")
                    }
                }
            },
            |_| errors += 1,
        )
        .await
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(errors, 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_after_report() {
        let cancel = CancellationToken::new();
        let mut errors = 0;
        let result: SyncResult<()> = retry_until_success(
            &cancel,
            fast(),
            || async { Err(SyncError::SubscriberTimeout) },
            |_| errors += 1,
        )
        .await;
        assert!(matches!(result, Err(SyncError::SubscriberTimeout)));
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn cancelled_error_is_not_reported() {
        let cancel = CancellationToken::new();
        let mut errors = 0;
        let result: SyncResult<()> = retry_until_success(
            &cancel,
            fast(),
            || async { Err(SyncError::Cancelled) },
            |_| errors += 1,
        )
        .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(errors, 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let slow =
            Backoff::new(Duration::from_secs(30), Duration::from_secs(60), 2.0).without_jitter();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let result: SyncResult<()> =
            retry_until_success(&cancel, slow, || async { Err(SyncError::Timeout) }, |_| {}).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut called = false;
        let result: SyncResult<()> = retry_until_success(
            &cancel,
            fast(),
            || {
                called = true;
                async { Ok(()) }
            },
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(!called);
    }

    #[tokio::test]
    async fn cancellation_interrupts_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result: SyncResult<()> = retry_until_success(
            &cancel,
            fast(),
            || std::future::pending(),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
