//! Notices for operations that take longer than expected.
//!
//! A slow operation is never abandoned because of its slowness. The monitor only tells a
//! [`SlowOperationListener`] about it, so that the user can be shown a non-blocking notice while
//! the operation keeps running.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SlowOperationConfig;

/// A notice about a slow operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowNotice {
    /// The operation passed the warning threshold.
    Warning,
    /// The operation passed the error threshold. It still continues to run.
    Error,
    /// The operation finished after a notice was shown, which can be taken down now.
    Dismiss,
}

/// Receives [`SlowNotice`]s from a [`SlowOperationMonitor`].
pub trait SlowOperationListener: Send + Sync {
    fn notify(&self, operation: &str, notice: SlowNotice, elapsed: Duration);
}

/// Logs notices.
#[derive(Debug, Default)]
pub struct TracingListener;

impl SlowOperationListener for TracingListener {
    fn notify(&self, operation: &str, notice: SlowNotice, elapsed: Duration) {
        let elapsed = humantime::format_duration(elapsed);
        match notice {
            SlowNotice::Warning => {
                tracing::warn!(operation, %elapsed, "Operation is taking longer than expected")
            }
            SlowNotice::Error => {
                tracing::error!(operation, %elapsed, "Operation is taking very long, still waiting")
            }
            SlowNotice::Dismiss => tracing::info!(operation, %elapsed, "Slow operation finished"),
        }
    }
}

/// Tracks running operations and reports those that are slow.
#[derive(Clone)]
pub struct SlowOperationMonitor {
    config: SlowOperationConfig,
    listener: Arc<dyn SlowOperationListener>,
    durations: Arc<Mutex<BTreeMap<String, Duration>>>,
}

impl fmt::Debug for SlowOperationMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlowOperationMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SlowOperationMonitor {
    pub fn new(config: SlowOperationConfig) -> Self {
        Self::with_listener(config, Arc::new(TracingListener))
    }

    pub fn with_listener(
        config: SlowOperationConfig,
        listener: Arc<dyn SlowOperationListener>,
    ) -> Self {
        Self {
            config,
            listener,
            durations: Default::default(),
        }
    }

    fn durations_mut(&self) -> MutexGuard<'_, BTreeMap<String, Duration>> {
        self.durations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `future` to completion, emitting notices while it is slow.
    pub async fn track<F: Future>(&self, operation: &str, future: F) -> F::Output {
        let start = Instant::now();
        let thresholds = [
            (self.config.warning_threshold, SlowNotice::Warning),
            (self.config.error_threshold, SlowNotice::Error),
        ];

        tokio::pin!(future);
        let mut notified = false;

        let mut output = None;
        for (threshold, notice) in thresholds {
            tokio::select! {
                biased;
                result = &mut future => {
                    output = Some(result);
                    break;
                }
                _ = tokio::time::sleep_until(start + threshold) => {
                    self.listener.notify(operation, notice, start.elapsed());
                    notified = true;
                }
            }
        }
        let output = match output {
            Some(output) => output,
            None => future.await,
        };

        let elapsed = start.elapsed();
        metric!(timer("operations.duration") = elapsed, "operation" => operation);
        if notified {
            self.listener.notify(operation, SlowNotice::Dismiss, elapsed);
        }
        self.durations_mut().insert(operation.to_owned(), elapsed);

        output
    }

    /// The duration of the last finished run of every tracked operation.
    pub fn durations(&self) -> BTreeMap<String, Duration> {
        self.durations_mut().clone()
    }

    pub fn clear_stats(&self) {
        self.durations_mut().clear();
    }
}
