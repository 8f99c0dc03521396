//! # Response caching and request coalescing
//!
//! Reads against the backend go through a [`RequestCache`], which combines two things:
//!
//! - An in-memory cache of successful responses. Every entry carries its own time-to-live, which
//!   the caller picks according to how volatile the data is. Expired entries are never served;
//!   they are purged lazily the next time they are looked up.
//! - A map of pending requests, which is used for request coalescing (deduplicating concurrent
//!   accesses). At most one request per key is in flight at any time, and every caller asking
//!   for that key while it is in flight joins it and observes the identical result.
//!
//! A lookup goes through the following steps:
//! - First, it checks the in-memory cache.
//! - On miss, it joins the pending request for the key, if there is one.
//! - Otherwise, it spawns the producer, registers it as pending *before returning*, and hands out
//!   a shared handle to its result.
//! - When the producer succeeds, its result is cached and the pending entry is removed. When it
//!   fails, only the pending entry is removed, so the next lookup starts afresh.
//!
//! Every pending request counts the callers waiting on it. A caller that goes away only detaches
//! itself, unless it was the last one. Then the request is aborted through its cancellation token,
//! its pending entry is removed right away, and whatever it produces is not cached.
//!
//! ### Metrics
//!
//! The following metrics are collected, each tagged with a `cache` field:
//!
//! - `requests.cache.access`: All accesses.
//! - `requests.cache.hit`: Accesses served by the in-memory cache.
//! - `requests.cache.expired`: Lookups that found an expired entry.
//! - `requests.dedup.hit`: Accesses that joined a pending request.
//! - `requests.dedup.miss`: Accesses that started a new request.
//! - `requests.dedup.abandoned`: Pending requests aborted because all their callers went away.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CacheConfig, Features};
use crate::error::RequestError;
use crate::utils::futures::CallOnDrop;

mod cache_key;
mod memory;

pub use cache_key::CacheKey;
pub use memory::CacheEntry;
use memory::InMemoryCache;

type FetchResult<T> = Result<T, RequestError>;

/// The receiving half of a spawned fetch, shared by all joiners.
type FetchChannel<T> = Shared<oneshot::Receiver<FetchResult<T>>>;

/// A request that is currently in flight.
struct PendingRequest<T> {
    /// Distinguishes consecutive requests for the same key.
    id: u64,
    channel: FetchChannel<T>,
    /// The number of callers still waiting for the result.
    waiters: usize,
    /// Aborts the request once no caller is waiting anymore.
    cancel: CancellationToken,
}

type PendingMap<T> = Arc<Mutex<HashMap<CacheKey, PendingRequest<T>>>>;

fn lock<T>(pending: &Mutex<T>) -> MutexGuard<'_, T> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Options that change how a single lookup uses the cache.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Ignore a cached value and fetch afresh.
    ///
    /// The request is still deduplicated, and its result still refreshes the cache.
    pub skip_cache: bool,
    /// The parent of the token handed to the producer, if this lookup starts a new request.
    ///
    /// Cancelling it aborts the request for every caller that joined it.
    pub parent: Option<CancellationToken>,
}

impl FetchOptions {
    fn fetch_token(&self) -> CancellationToken {
        match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        }
    }
}

/// A cache of successful responses which also coalesces concurrent requests for the same key.
///
/// Cloning a [`RequestCache`] is cheap and yields a handle to the same underlying state.
pub struct RequestCache<T> {
    name: &'static str,
    features: Features,

    /// The in-memory cache of successful responses.
    cache: InMemoryCache<T>,

    /// Requests that are currently in flight, by key.
    pending: PendingMap<T>,

    next_id: Arc<AtomicU64>,
}

impl<T> Clone for RequestCache<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            features: self.features,
            cache: self.cache.clone(),
            pending: Arc::clone(&self.pending),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> fmt::Debug for RequestCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.try_lock().map(|p| p.len()).unwrap_or_default();
        f.debug_struct("RequestCache")
            .field("name", &self.name)
            .field("features", &self.features)
            .field("in-memory items", &self.cache.entry_count())
            .field("pending requests", &pending)
            .finish()
    }
}

impl<T> RequestCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, config: &CacheConfig, features: Features) -> Self {
        Self {
            name,
            features,
            cache: memory::build_cache(name, config.in_memory_capacity),
            pending: Default::default(),
            next_id: Default::default(),
        }
    }

    /// Returns the cached value for `key`, if it has not expired yet.
    ///
    /// An expired entry is removed as a side effect.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let entry = self.cache.get(key)?;
        if entry.is_valid(Instant::now()) {
            return Some(entry.data);
        }

        metric!(counter("requests.cache.expired") += 1, "cache" => self.name);
        tracing::trace!(cache = self.name, %key, "Cache entry expired");
        self.cache.invalidate(key);
        None
    }

    /// Stores `value` under `key` for the duration of `ttl`, replacing any previous entry.
    ///
    /// This does nothing when caching is disabled.
    pub fn insert(&self, key: CacheKey, value: T, ttl: Duration) {
        if !self.features.enable_caching {
            return;
        }
        tracing::trace!(cache = self.name, %key, ttl = %humantime::format_duration(ttl), "Caching response");
        self.cache.insert(key, CacheEntry::new(value, ttl));
    }

    /// Removes the cached value for `key`, so that the next lookup misses.
    pub fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    /// Removes all cached values.
    ///
    /// Requests that are currently in flight are not affected.
    pub fn clear(&self) {
        tracing::debug!(cache = self.name, "Clearing cache");
        self.cache.invalidate_all();
    }

    /// The number of cached entries.
    ///
    /// This may include entries that have expired but were not looked up since.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of requests currently in flight.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether a request for `key` is currently in flight.
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        lock(&self.pending).contains_key(key)
    }

    /// Returns the cached value for `key`, or fetches it using `producer`.
    ///
    /// If a request for `key` is already in flight, this joins it instead of calling `producer`.
    /// A successful result is cached for `ttl`, a failed one is not cached at all.
    ///
    /// `producer` receives a token that is cancelled when the request is aborted, either through
    /// [`FetchOptions::parent`] or because every caller dropped the returned future. An aborted
    /// request is never cached.
    ///
    /// NOTE: This function itself is *not* `async`. The lookup and the registration of the
    /// pending request happen eagerly when it is called, so two calls in a row always coalesce
    /// even if neither of the returned futures has been polled yet.
    pub fn get_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        options: FetchOptions,
        producer: F,
    ) -> BoxFuture<'static, FetchResult<T>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let name = self.name;
        metric!(counter("requests.cache.access") += 1, "cache" => name);

        let use_cache = self.features.enable_caching && !options.skip_cache;
        if use_cache && let Some(value) = self.get(key) {
            metric!(counter("requests.cache.hit") += 1, "cache" => name);
            tracing::trace!(cache = name, %key, "Cache hit");
            return Box::pin(future::ready(Ok(value)));
        }

        if !self.features.enable_request_dedup {
            let this = self.clone();
            let key = key.clone();
            let cancel = options.fetch_token();
            let fetch = producer(cancel.clone());
            return Box::pin(async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(RequestError::Cancelled),
                    result = fetch => result,
                };
                if let Ok(value) = &result {
                    this.insert(key, value.clone(), ttl);
                }
                result
            });
        }

        let (id, channel) = {
            let mut pending = lock(&self.pending);

            // The request for this key might have completed since we checked above.
            if use_cache && let Some(value) = self.get(key) {
                metric!(counter("requests.cache.hit") += 1, "cache" => name);
                return Box::pin(future::ready(Ok(value)));
            }

            if let Some(request) = pending.get_mut(key) {
                // A concurrent request was deduplicated.
                metric!(counter("requests.dedup.hit") += 1, "cache" => name);
                tracing::trace!(cache = name, %key, "Joining pending request");
                request.waiters += 1;
                (request.id, request.channel.clone())
            } else {
                metric!(counter("requests.dedup.miss") += 1, "cache" => name);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let cancel = options.fetch_token();
                let fetch = producer(cancel.clone());
                let channel = self.spawn_fetch(key.clone(), id, ttl, cancel.clone(), fetch);
                let request = PendingRequest {
                    id,
                    channel: channel.clone(),
                    waiters: 1,
                    cancel,
                };
                let evicted = pending.insert(key.clone(), request);
                debug_assert!(evicted.is_none());
                (id, channel)
            }
        };

        // Counted as waiting until the result arrives or the caller goes away.
        let waiter = {
            let pending = Arc::clone(&self.pending);
            let key = key.clone();
            CallOnDrop::new(move || release_waiter(&mut lock(&pending), name, &key, id))
        };

        Box::pin(async move {
            let result = channel.await;
            drop(waiter);
            result.unwrap_or_else(|_cancelled| {
                tracing::error!(cache = name, "Pending request was dropped before completing");
                Err(RequestError::InternalError)
            })
        })
    }

    /// Spawns `fetch` as its own task and returns a shareable channel to its result.
    ///
    /// The task outlives the callers that are waiting on it, so a caller going away does not
    /// abort the request for everyone else. It stops early once `cancel` is cancelled, and then
    /// caches nothing. The pending entry is removed when the task ends, whichever way it ends.
    fn spawn_fetch<Fut>(
        &self,
        key: CacheKey,
        id: u64,
        ttl: Duration,
        cancel: CancellationToken,
        fetch: Fut,
    ) -> FetchChannel<T>
    where
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let remove_pending_token = {
            let pending = Arc::clone(&self.pending);
            let key = key.clone();
            CallOnDrop::new(move || remove_pending(&mut lock(&pending), &key, id))
        };

        let this = self.clone();
        let task = async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RequestError::Cancelled),
                result = fetch => result,
            };

            {
                // Cache the result and retire the pending request in one step, so that callers
                // either join this request or find its result in the cache.
                let mut pending = lock(&this.pending);
                match &result {
                    Ok(_) if cancel.is_cancelled() => {
                        tracing::debug!(cache = this.name, %key, "Request was aborted, not caching")
                    }
                    Ok(value) => this.insert(key.clone(), value.clone(), ttl),
                    Err(error) => {
                        tracing::debug!(cache = this.name, %key, %error, "Request failed, not caching")
                    }
                }
                remove_pending(&mut pending, &key, id);
            }
            drop(remove_pending_token);

            sender.send(result).ok();
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        receiver.shared()
    }
}

fn remove_pending<T>(pending: &mut HashMap<CacheKey, PendingRequest<T>>, key: &CacheKey, id: u64) {
    if pending.get(key).is_some_and(|request| request.id == id) {
        pending.remove(key);
    }
}

/// Detaches one caller from the pending request `id`, and aborts it if that was the last one.
///
/// Once the request has finished its entry is gone already, and this does nothing.
fn release_waiter<T>(
    pending: &mut HashMap<CacheKey, PendingRequest<T>>,
    name: &'static str,
    key: &CacheKey,
    id: u64,
) {
    let Some(request) = pending.get_mut(key).filter(|request| request.id == id) else {
        return;
    };
    request.waiters = request.waiters.saturating_sub(1);
    if request.waiters == 0 {
        metric!(counter("requests.dedup.abandoned") += 1, "cache" => name);
        tracing::debug!(cache = name, %key, "All callers went away, aborting request");
        request.cancel.cancel();
        pending.remove(key);
    }
}
