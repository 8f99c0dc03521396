//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{ErrorKind, RequestError, classify};

/// Describes a retry that is about to happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// The number of the upcoming retry, starting at `1`.
    pub attempt_number: u32,
    /// How long we wait before issuing it.
    pub delay_before: Duration,
    /// The error of the attempt that just failed.
    pub error: RequestError,
}

/// The delay before the retry following attempt number `index` (0-based).
pub fn backoff_delay(base_delay: Duration, index: u32) -> Duration {
    base_delay.saturating_mul(2u32.saturating_pow(index))
}

/// Runs `operation` until it succeeds, up to `1 + config.max_retries` times.
///
/// Only errors classified as retryable are retried. Cancellation always propagates right away,
/// including a cancellation of `cancel` that happens while waiting for the next attempt. Once
/// all attempts are used up, the error of the last one is returned unchanged.
///
/// `on_retry` is called before every backoff delay.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    on_retry: Option<&(dyn Fn(&RetryAttempt) + Send + Sync)>,
    mut operation: F,
) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut index = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let kind = classify(&error, &config.retryable_statuses);
        if kind == ErrorKind::Cancelled || !kind.is_retryable() || index >= config.max_retries {
            return Err(error);
        }

        let attempt = RetryAttempt {
            attempt_number: index + 1,
            delay_before: backoff_delay(config.base_delay, index),
            error,
        };

        metric!(counter("requests.retry") += 1, "kind" => kind.as_str());
        tracing::debug!(
            attempt = attempt.attempt_number,
            delay = %humantime::format_duration(attempt.delay_before),
            error = %attempt.error,
            "Retrying request"
        );
        if let Some(on_retry) = on_retry {
            on_retry(&attempt);
        }

        match cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RequestError::Cancelled),
                _ = tokio::time::sleep(attempt.delay_before) => {}
            },
            None => tokio::time::sleep(attempt.delay_before).await,
        }

        index += 1;
    }
}
