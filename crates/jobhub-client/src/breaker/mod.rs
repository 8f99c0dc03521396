//! Graceful degradation for dependencies that are allowed to fail.
//!
//! Some backends, most prominently AI completions, are optional: when they are unhealthy the
//! client should show cached or default data instead of an error. A [`CircuitBreaker`] tracks
//! consecutive failures per dependency and stops issuing calls for a cooldown period once a
//! threshold is reached. A [`ConcurrencyLimiter`] additionally sheds load above a fixed number
//! of simultaneous calls. [`Degradable`] combines the two.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{CircuitBreakerConfig, DegradableConfig};
use crate::error::RequestError;

mod limiter;

pub use limiter::{ConcurrencyLimiter, Permit};

/// Identifies a degradable dependency, such as `"ai"`.
///
/// A dependency can serve many different endpoints, all of which share one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyId(Arc<str>);

impl DependencyId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DependencyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Whether calls to a dependency go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Calls are issued normally.
    Closed,
    /// Calls are skipped until the cooldown has passed.
    Open,
}

#[derive(Debug, Default)]
struct CircuitState {
    failure_count: u32,
    last_failure_at: Option<Instant>,
}

/// Tracks consecutive failures per dependency.
///
/// The circuit of a dependency is open while it has at least `failure_threshold` failures and
/// the last one happened less than `cooldown` ago. Once the cooldown has passed, the next check
/// resets the failures, which closes the circuit again. There is no background timer.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    circuits: Arc<Mutex<HashMap<DependencyId, CircuitState>>>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
            circuits: Default::default(),
        }
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<DependencyId, CircuitState>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether calls to `dependency` should be skipped right now.
    ///
    /// If the cooldown since the last failure has passed, this resets the failures first.
    pub fn is_open(&self, dependency: &DependencyId) -> bool {
        let mut circuits = self.circuits();
        let Some(state) = circuits.get_mut(dependency) else {
            return false;
        };
        let Some(last_failure_at) = state.last_failure_at else {
            return false;
        };

        if last_failure_at.elapsed() >= self.cooldown {
            if state.failure_count >= self.failure_threshold {
                metric!(counter("requests.circuit.reset") += 1, "dependency" => dependency.as_str());
                tracing::info!(%dependency, "Cooldown passed, closing circuit");
            }
            *state = CircuitState::default();
            return false;
        }

        state.failure_count >= self.failure_threshold
    }

    /// The current status of the circuit for `dependency`.
    pub fn state(&self, dependency: &DependencyId) -> CircuitStatus {
        if self.is_open(dependency) {
            CircuitStatus::Open
        } else {
            CircuitStatus::Closed
        }
    }

    /// The number of consecutive failures recorded for `dependency`.
    pub fn failure_count(&self, dependency: &DependencyId) -> u32 {
        self.circuits()
            .get(dependency)
            .map_or(0, |state| state.failure_count)
    }

    pub fn record_failure(&self, dependency: &DependencyId) {
        let mut circuits = self.circuits();
        let state = circuits.entry(dependency.clone()).or_default();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(Instant::now());

        if state.failure_count == self.failure_threshold {
            metric!(counter("requests.circuit.opened") += 1, "dependency" => dependency.as_str());
            tracing::info!(
                %dependency,
                failures = state.failure_count,
                cooldown = %humantime::format_duration(self.cooldown),
                "Too many consecutive failures, opening circuit"
            );
        } else {
            tracing::debug!(%dependency, failures = state.failure_count, "Recorded failure");
        }
    }

    pub fn record_success(&self, dependency: &DependencyId) {
        if let Some(state) = self.circuits().get_mut(dependency) {
            *state = CircuitState::default();
        }
    }
}

/// When [`Degradable::call`] serves the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Only while the circuit is open. Failures are returned to the caller.
    #[default]
    OnOpen,
    /// While the circuit is open, and in place of any failure other than a cancellation.
    OnOpenOrFailure,
}

/// The result of a call to a degradable dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The dependency answered.
    Fresh(T),
    /// The dependency was skipped or failed, and the fallback was served instead.
    Fallback(T),
}

impl<T> Outcome<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Fresh(value) | Self::Fallback(value) => value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Fresh(value) => Outcome::Fresh(f(value)),
            Self::Fallback(value) => Outcome::Fallback(f(value)),
        }
    }
}

/// Guards calls to degradable dependencies with a [`CircuitBreaker`] and a [`ConcurrencyLimiter`].
#[derive(Debug, Clone)]
pub struct Degradable {
    breaker: CircuitBreaker,
    limiter: ConcurrencyLimiter,
}

impl Degradable {
    pub fn new(breaker: &CircuitBreakerConfig, degradable: &DegradableConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker),
            limiter: ConcurrencyLimiter::new(degradable.max_concurrent_requests),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Calls `operation` unless the circuit for `dependency` is open.
    ///
    /// While the circuit is open, no call is issued and `fallback` is served right away. The
    /// outcome of an issued call is recorded on the circuit, except for cancellations, which
    /// say nothing about the health of the dependency. Calls above the concurrency cap fail
    /// with [`RequestError::Overloaded`] and are not recorded either.
    pub async fn call<T, F, Fut>(
        &self,
        dependency: &DependencyId,
        policy: FallbackPolicy,
        fallback: impl FnOnce() -> T,
        operation: F,
    ) -> Result<Outcome<T>, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        if self.breaker.is_open(dependency) {
            metric!(counter("requests.fallback") += 1, "dependency" => dependency.as_str(), "reason" => "open");
            tracing::debug!(%dependency, "Circuit open, serving fallback");
            return Ok(Outcome::Fallback(fallback()));
        }

        let permit = self.limiter.try_acquire(dependency)?;
        let result = operation().await;
        drop(permit);

        match result {
            Ok(value) => {
                self.breaker.record_success(dependency);
                Ok(Outcome::Fresh(value))
            }
            Err(RequestError::Cancelled) => Err(RequestError::Cancelled),
            Err(error) => {
                self.breaker.record_failure(dependency);
                match policy {
                    FallbackPolicy::OnOpen => Err(error),
                    FallbackPolicy::OnOpenOrFailure => {
                        metric!(counter("requests.fallback") += 1, "dependency" => dependency.as_str(), "reason" => "failure");
                        tracing::warn!(%dependency, %error, "Call failed, serving fallback");
                        Ok(Outcome::Fallback(fallback()))
                    }
                }
            }
        }
    }
}
