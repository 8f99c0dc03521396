use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::DependencyId;
use crate::error::RequestError;

/// Caps the number of simultaneous calls per dependency.
///
/// Calls above the cap are rejected with [`RequestError::Overloaded`] right away. There is no
/// queue: a rejected caller is expected to degrade, not to wait.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    max_concurrent_requests: usize,
    in_flight: Arc<Mutex<HashMap<DependencyId, Arc<AtomicUsize>>>>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent_requests: usize) -> Self {
        Self {
            max_concurrent_requests,
            in_flight: Default::default(),
        }
    }

    fn counter(&self, dependency: &DependencyId) -> Arc<AtomicUsize> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(in_flight.entry(dependency.clone()).or_default())
    }

    /// Reserves a slot for a call to `dependency`.
    ///
    /// The slot is held until the returned [`Permit`] is dropped.
    pub fn try_acquire(&self, dependency: &DependencyId) -> Result<Permit, RequestError> {
        let counter = self.counter(dependency);
        let max = self.max_concurrent_requests;

        match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < max).then_some(current + 1)
        }) {
            Ok(_) => Ok(Permit { counter }),
            Err(current) => {
                metric!(counter("requests.overloaded") += 1, "dependency" => dependency.as_str());
                tracing::warn!(
                    %dependency,
                    in_flight = current,
                    "Too many concurrent requests, rejecting call"
                );
                Err(RequestError::Overloaded(dependency.to_string()))
            }
        }
    }

    /// The number of calls to `dependency` currently holding a permit.
    pub fn in_flight(&self, dependency: &DependencyId) -> usize {
        self.counter(dependency).load(Ordering::Acquire)
    }
}

/// A reserved slot of a [`ConcurrencyLimiter`], released on drop.
#[derive(Debug)]
pub struct Permit {
    counter: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
