//! Deadlines and cancellation for single request attempts.
//!
//! Every invocation ends in exactly one of three ways: the operation settles, the deadline
//! elapses ([`RequestError::Timeout`]), or the caller cancels ([`RequestError::Cancelled`]).
//! The latter two are never conflated, since callers react to them differently.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::RequestError;

/// Races `operation` against a deadline of `timeout` and against the `external` token.
///
/// `operation` receives a token that is cancelled as soon as the call ends with a timeout or
/// a cancellation, so that it can abort whatever it has in flight. If the operation settles
/// first, its result is returned unchanged and the deadline timer is dropped along with it.
pub async fn with_timeout<T, F, Fut>(
    timeout: Duration,
    external: Option<&CancellationToken>,
    operation: F,
) -> Result<T, RequestError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let token = match external {
        Some(external) => external.child_token(),
        None => CancellationToken::new(),
    };
    // Aborts the operation on every exit path except settling.
    let guard = token.clone().drop_guard();

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(RequestError::Cancelled),
        result = operation(token.clone()) => {
            guard.disarm();
            return result;
        }
        _ = tokio::time::sleep(timeout) => Err(RequestError::Timeout(timeout)),
    };

    if let Err(RequestError::Timeout(timeout)) = &result {
        tracing::debug!(timeout = %humantime::format_duration(*timeout), "Request timed out");
    }
    result
}

/// Runs `operation` with the `fast` deadline, and once more with the `slow` deadline if that
/// timed out.
///
/// This suits endpoints that usually answer quickly but occasionally have to wait on a slow
/// database. Errors other than a timeout of the first attempt are returned right away.
pub async fn with_escalating_timeout<T, F, Fut>(
    fast: Duration,
    slow: Duration,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> Result<T, RequestError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    match with_timeout(fast, cancel, &mut operation).await {
        Err(RequestError::Timeout(_)) if !cancel.is_some_and(|c| c.is_cancelled()) => {
            metric!(counter("requests.timeout.escalated") += 1);
            tracing::info!(
                fast = %humantime::format_duration(fast),
                slow = %humantime::format_duration(slow),
                "Request timed out, retrying with a longer deadline"
            );
            with_timeout(slow, cancel, operation).await
        }
        result => result,
    }
}
