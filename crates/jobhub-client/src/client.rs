//! The request layer as a whole.
//!
//! A [`RequestLayer`] is created once per application and cloned into every place that talks
//! to the backend. A cached read flows through the layer like this:
//!
//! 1. The [`RequestCache`] serves a valid cached response, or joins a pending request for the
//!    same key.
//! 2. Otherwise a new request is spawned, which is retried with backoff ([`with_retry`]).
//! 3. Every attempt runs under a deadline ([`with_timeout`]) and goes out through the
//!    [`Transport`].
//! 4. Calls to degradable dependencies are additionally gated by a circuit breaker and a
//!    concurrency cap ([`Degradable`]), and served a fallback while the dependency is unhealthy.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::breaker::{Degradable, DependencyId, FallbackPolicy, Outcome};
use crate::caching::{CacheKey, FetchOptions, RequestCache};
use crate::config::{Config, TimeoutTier, TtlTier};
use crate::error::RequestError;
use crate::monitor::SlowOperationMonitor;
use crate::retry::with_retry;
use crate::timeout::{with_escalating_timeout, with_timeout};
use crate::transport::{Method, Transport, TransportRequest};
use crate::utils::futures::{m, measure};

/// Per-call options of a [`RequestLayer`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// The deadline tier of every attempt. Defaults to [`TimeoutTier::Default`].
    pub timeout: Option<TimeoutTier>,
    /// A longer tier to retry with once if an attempt times out.
    pub escalate_to: Option<TimeoutTier>,
    /// Bypass a cached response, see [`FetchOptions::skip_cache`].
    pub skip_cache: bool,
    /// Cancels this call.
    ///
    /// For a cached read this detaches the caller. The underlying request keeps running as long
    /// as anyone else is waiting for it, and is aborted once the last caller went away.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, tier: TimeoutTier) -> Self {
        self.timeout = Some(tier);
        self
    }

    pub fn with_escalation(mut self, tier: TimeoutTier) -> Self {
        self.escalate_to = Some(tier);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

struct Inner {
    config: Config,
    transport: Arc<dyn Transport>,
    cache: RequestCache<Arc<Value>>,
    degradable: Degradable,
    monitor: SlowOperationMonitor,
    /// Parent of the cancellation tokens of all requests, replaced on [`RequestLayer::cancel_all`].
    root: Mutex<CancellationToken>,
}

/// Resilient access to the backend, see the [module docs](self).
#[derive(Clone)]
pub struct RequestLayer {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLayer")
            .field("base_url", &self.inner.config.base_url)
            .field("transport", &self.inner.transport)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

impl RequestLayer {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self::with_monitor(
            SlowOperationMonitor::new(config.slow_operations),
            config,
            transport,
        )
    }

    /// Creates a layer reporting slow operations to the given `monitor`.
    pub fn with_monitor(
        monitor: SlowOperationMonitor,
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let cache = RequestCache::new("responses", &config.cache, config.features);
        let degradable = Degradable::new(&config.circuit_breaker, &config.degradable);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                cache,
                degradable,
                monitor,
                root: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache(&self) -> &RequestCache<Arc<Value>> {
        &self.inner.cache
    }

    pub fn degradable(&self) -> &Degradable {
        &self.inner.degradable
    }

    pub fn monitor(&self) -> &SlowOperationMonitor {
        &self.inner.monitor
    }

    fn root_token(&self) -> CancellationToken {
        self.inner
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetches `endpoint` with the given query `params`, and decodes the response as `T`.
    ///
    /// Responses are cached for the duration of `ttl` and concurrent reads are coalesced, see
    /// [`RequestCache::get_or_fetch`].
    pub async fn fetch_json<T, P>(
        &self,
        endpoint: &str,
        params: Option<&P>,
        ttl: TtlTier,
        options: RequestOptions,
    ) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let value = self.fetch_value(endpoint, params, ttl, options).await?;
        Ok(T::deserialize(value.as_ref())?)
    }

    /// Fetches `endpoint` like [`fetch_json`](Self::fetch_json), without decoding the response.
    ///
    /// All callers that are served the same cached or coalesced response share one value.
    pub async fn fetch_value<P>(
        &self,
        endpoint: &str,
        params: Option<&P>,
        ttl: TtlTier,
        options: RequestOptions,
    ) -> Result<Arc<Value>, RequestError>
    where
        P: Serialize + ?Sized,
    {
        let key = CacheKey::for_endpoint(endpoint, params)?;
        let query = params.map(serde_json::to_value).transpose()?;
        let request = TransportRequest::get(endpoint).with_query(query);
        let ttl = self.inner.config.cache.ttl.get(ttl);

        let fetch_options = FetchOptions {
            skip_cache: options.skip_cache,
            parent: Some(self.root_token()),
        };
        let producer = |cancel: CancellationToken| {
            let this = self.clone();
            let options = options.clone();
            let operation = endpoint.to_owned();
            async move {
                let request = this.execute(request, &options, &cancel);
                let value = this.inner.monitor.track(&operation, request).await?;
                Ok::<_, RequestError>(Arc::new(value))
            }
        };
        let fetch = self.inner.cache.get_or_fetch(&key, ttl, fetch_options, producer);

        let fetch = measure("fetch", m::request, fetch);
        detach_on_cancel(options.cancel.as_ref(), fetch).await
    }

    /// Calls `dependency` through [`fetch_json`](Self::fetch_json), unless its circuit is open.
    ///
    /// While the circuit is open, `fallback` is served right away instead. Without an explicit
    /// deadline in `options`, attempts use [`TimeoutTier::Slow`].
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_degradable<T, P>(
        &self,
        dependency: &DependencyId,
        endpoint: &str,
        params: Option<&P>,
        ttl: TtlTier,
        policy: FallbackPolicy,
        fallback: impl FnOnce() -> T,
        mut options: RequestOptions,
    ) -> Result<Outcome<T>, RequestError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        options.timeout.get_or_insert(TimeoutTier::Slow);
        self.inner
            .degradable
            .call(dependency, policy, fallback, || {
                self.fetch_json(endpoint, params, ttl, options)
            })
            .await
    }

    /// Sends an uncached request, such as a `POST`.
    ///
    /// The request is retried just like a read, but only for failures that are classified as
    /// transient, so that a request the backend has rejected is never repeated.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        let request = TransportRequest::new(method, path).with_body(body);
        let root = self.root_token();

        let send = self.inner.monitor.track(path, self.execute(request, &options, &root));
        let send = measure("send", m::request, send);
        detach_on_cancel(options.cancel.as_ref(), send).await
    }

    /// Runs `request` with retries, applying a deadline to every attempt.
    async fn execute(
        &self,
        request: TransportRequest,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<Value, RequestError> {
        let Inner {
            config, transport, ..
        } = &*self.inner;

        let fast = config.timeouts.get(options.timeout.unwrap_or(TimeoutTier::Default));
        let slow = options.escalate_to.map(|tier| config.timeouts.get(tier));
        // The transport deadline is only a backstop, attempts are timed out below.
        let request = request.with_timeout(slow.unwrap_or(fast).max(fast));

        with_retry(&config.retry, Some(cancel), None, || {
            let call = |token: CancellationToken| transport.call(request.clone(), token);
            async move {
                match slow {
                    Some(slow) => with_escalating_timeout(fast, slow, Some(cancel), call).await,
                    None => with_timeout(fast, Some(cancel), call).await,
                }
            }
        })
        .await
    }

    /// Aborts every request that was started through this layer.
    ///
    /// Requests started afterwards are not affected.
    pub fn cancel_all(&self) {
        let mut root = self.inner.root.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("Cancelling all in-flight requests");
        root.cancel();
        *root = CancellationToken::new();
    }

    /// Removes the cached response of `endpoint` with `params`.
    pub fn invalidate<P: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        params: Option<&P>,
    ) -> Result<(), RequestError> {
        let key = CacheKey::for_endpoint(endpoint, params)?;
        self.inner.cache.invalidate(&key);
        Ok(())
    }

    /// Removes all cached responses, for instance on logout.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }
}

/// Stops waiting for `future` once `cancel` is cancelled.
async fn detach_on_cancel<T>(
    cancel: Option<&CancellationToken>,
    future: impl Future<Output = Result<T, RequestError>>,
) -> Result<T, RequestError> {
    match cancel {
        Some(cancel) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RequestError::Cancelled),
            result = future => result,
        },
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::test::{self, ScriptedTransport};

    #[derive(Debug, PartialEq, Deserialize)]
    struct JobsPage {
        jobs: Vec<String>,
        total: u32,
    }

    fn jobs_page() -> Value {
        json!({"jobs": ["Rust Engineer", "SRE"], "total": 42})
    }

    fn unavailable() -> RequestError {
        RequestError::Status {
            status: 503,
            message: "Service Unavailable".into(),
        }
    }

    fn layer(config: Config) -> (RequestLayer, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        (RequestLayer::new(config, transport.clone()), transport)
    }

    fn no_retries() -> Config {
        let mut config = Config::default();
        config.retry.max_retries = 0;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_read() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport.respond("/jobs/", Duration::from_millis(200), Ok(jobs_page()));

        let params = json!({"page": 1});
        let first = layer
            .fetch_value("/jobs/", Some(&params), TtlTier::Short, Default::default())
            .await
            .unwrap();

        let start = Instant::now();
        let second = layer
            .fetch_value("/jobs/", Some(&params), TtlTier::Short, Default::default())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.calls("/jobs/"), 1);
        assert_eq!(transport.requests()[0].query, Some(params.clone()));

        let page: JobsPage = layer
            .fetch_json("/jobs/", Some(&params), TtlTier::Short, Default::default())
            .await
            .unwrap();
        assert_eq!(page.total, 42);
        assert_eq!(transport.calls("/jobs/"), 1);

        // Different params are a different request.
        layer
            .fetch_value("/jobs/", Some(&json!({"page": 2})), TtlTier::Short, Default::default())
            .await
            .unwrap();
        assert_eq!(transport.calls("/jobs/"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_coalesce() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport.respond("/jobs/", Duration::from_millis(200), Ok(jobs_page()));

        let reads = (0..10).map(|_| {
            layer.fetch_json::<JobsPage, ()>("/jobs/", None, TtlTier::Short, Default::default())
        });
        for page in futures::future::join_all(reads).await {
            assert_eq!(page.unwrap().jobs, ["Rust Engineer", "SRE"]);
        }
        assert_eq!(transport.calls("/jobs/"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport
            .respond("/jobs/", Duration::ZERO, Err(unavailable()))
            .respond("/jobs/", Duration::ZERO, Ok(jobs_page()));

        let start = Instant::now();
        let page: JobsPage = layer
            .fetch_json::<_, ()>("/jobs/", None, TtlTier::Short, Default::default())
            .await
            .unwrap();

        assert_eq!(page.total, 42);
        assert_eq!(transport.calls("/jobs/"), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried_or_cached() {
        test::setup();

        let (layer, transport) = layer(Config::default());

        for _ in 0..2 {
            let result = layer
                .fetch_value::<()>("/jobs/404", None, TtlTier::Short, Default::default())
                .await;
            assert_eq!(result.unwrap_err().status(), Some(404));
        }
        assert_eq!(transport.calls("/jobs/404"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        test::setup();

        let (layer, transport) = layer(no_retries());
        transport.respond("/reports/", Duration::from_secs(120), Ok(json!([])));

        let start = Instant::now();
        let result = layer
            .fetch_value::<()>("/reports/", None, TtlTier::Default, Default::default())
            .await;

        assert_eq!(result, Err(RequestError::Timeout(Duration::from_secs(45))));
        assert_eq!(start.elapsed(), Duration::from_secs(45));

        let result = layer
            .fetch_value::<()>(
                "/reports/",
                None,
                TtlTier::Default,
                RequestOptions::default().with_timeout(TimeoutTier::Fast),
            )
            .await;
        assert_eq!(result, Err(RequestError::Timeout(Duration::from_secs(15))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_escalation() {
        test::setup();

        let (layer, transport) = layer(no_retries());
        transport.respond("/dashboard/", Duration::from_secs(20), Ok(json!({"views": 7})));

        let options = RequestOptions::default()
            .with_timeout(TimeoutTier::Fast)
            .with_escalation(TimeoutTier::Default);

        let start = Instant::now();
        let value = layer
            .fetch_value::<()>("/dashboard/", None, TtlTier::Short, options)
            .await
            .unwrap();

        assert_eq!(*value, json!({"views": 7}));
        assert_eq!(transport.calls("/dashboard/"), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport.respond("/jobs/", Duration::from_secs(10), Ok(jobs_page()));

        let read = tokio::spawn({
            let layer = layer.clone();
            async move {
                layer
                    .fetch_value::<()>("/jobs/", None, TtlTier::Short, Default::default())
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(layer.cache().pending_len(), 1);
        layer.cancel_all();

        assert_eq!(read.await.unwrap(), Err(RequestError::Cancelled));
        assert_eq!(layer.cache().pending_len(), 0);
        assert_eq!(transport.calls("/jobs/"), 1);

        // New requests are not affected.
        let value = layer
            .fetch_value::<()>("/jobs/", None, TtlTier::Short, Default::default())
            .await
            .unwrap();
        assert_eq!(*value, jobs_page());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancel_detaches() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport.respond("/jobs/", Duration::from_secs(2), Ok(jobs_page()));

        let cancel = CancellationToken::new();
        let patient =
            layer.fetch_value::<()>("/jobs/", None, TtlTier::Short, Default::default());
        let cancelled = layer.fetch_value::<()>(
            "/jobs/",
            None,
            TtlTier::Short,
            RequestOptions::default().with_cancel(cancel.clone()),
        );

        // The patient caller starts the request, the other one joins and leaves again.
        let (patient, cancelled) = futures::join!(patient, async {
            cancel.cancel();
            cancelled.await
        });

        assert_eq!(cancelled, Err(RequestError::Cancelled));
        assert_eq!(*patient.unwrap(), jobs_page());
        assert_eq!(transport.calls("/jobs/"), 1);
        assert_eq!(layer.cache().len(), 1);
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(delay).await;
                cancel.cancel();
            }
        });
        cancel
    }

    #[tokio::test(start_paused = true)]
    async fn test_sole_caller_cancel_stops_retries() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport.respond("/jobs/", Duration::ZERO, Err(unavailable()));

        let options = RequestOptions::default().with_cancel(cancel_after(Duration::from_millis(500)));
        let result = layer
            .fetch_value::<()>("/jobs/", None, TtlTier::Short, options)
            .await;
        assert_eq!(result, Err(RequestError::Cancelled));
        assert_eq!(layer.cache().pending_len(), 0);

        // No retry goes out after the backoff delays would have passed.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls("/jobs/"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sole_caller_cancel_is_not_cached() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport.respond("/jobs/", Duration::from_secs(2), Ok(jobs_page()));

        let options = RequestOptions::default().with_cancel(cancel_after(Duration::from_millis(500)));
        let result = layer
            .fetch_value::<()>("/jobs/", None, TtlTier::Short, options)
            .await;
        assert_eq!(result, Err(RequestError::Cancelled));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(layer.cache().len(), 0);
        assert_eq!(transport.calls("/jobs/"), 1);

        // The next read starts a new request instead of joining the aborted one.
        let value = layer
            .fetch_value::<()>("/jobs/", None, TtlTier::Short, Default::default())
            .await
            .unwrap();
        assert_eq!(*value, jobs_page());
        assert_eq!(transport.calls("/jobs/"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_degradable() {
        test::setup();

        let (layer, transport) = layer(no_retries());
        for _ in 0..3 {
            transport.respond("/ai/summary", Duration::ZERO, Err(unavailable()));
        }
        transport.respond("/ai/summary", Duration::ZERO, Ok(json!("Great candidate")));

        let ai = DependencyId::from("ai");
        let summarize = || {
            layer.fetch_degradable::<String, ()>(
                &ai,
                "/ai/summary",
                None,
                TtlTier::AiResults,
                FallbackPolicy::OnOpen,
                || "No summary available".to_owned(),
                Default::default(),
            )
        };

        for _ in 0..3 {
            assert_eq!(summarize().await, Err(unavailable()));
        }
        assert_eq!(transport.calls("/ai/summary"), 3);

        let outcome = summarize().await.unwrap();
        assert_eq!(outcome, Outcome::Fallback("No summary available".to_owned()));
        assert_eq!(transport.calls("/ai/summary"), 3);

        // The circuit closes after the cooldown, and the recovered dependency answers fresh.
        tokio::time::advance(Duration::from_secs(60)).await;
        let outcome = summarize().await.unwrap();
        assert_eq!(outcome, Outcome::Fresh("Great candidate".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_degradable_cancelled() {
        test::setup();

        let (layer, transport) = layer(no_retries());
        transport.respond("/ai/summary", Duration::from_secs(10), Ok(json!("Great candidate")));

        let ai = DependencyId::from("ai");
        let options = RequestOptions::default().with_cancel(cancel_after(Duration::from_secs(1)));
        let start = Instant::now();
        let result = layer
            .fetch_degradable::<String, ()>(
                &ai,
                "/ai/summary",
                None,
                TtlTier::AiResults,
                FallbackPolicy::OnOpenOrFailure,
                || "No summary available".to_owned(),
                options,
            )
            .await;

        assert_eq!(result, Err(RequestError::Cancelled));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(layer.degradable().breaker().failure_count(&ai), 0);
        assert_eq!(layer.degradable().limiter().in_flight(&ai), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(layer.cache().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_is_not_cached() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport.respond("/applications/", Duration::ZERO, Ok(json!({"id": 1})));

        let body = json!({"job_id": 7, "cover_letter": "Hi"});
        for _ in 0..2 {
            let value = layer
                .send(Method::Post, "/applications/", Some(body.clone()), Default::default())
                .await
                .unwrap();
            assert_eq!(value, json!({"id": 1}));
        }

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].body, Some(body));
        assert_eq!(requests[0].timeout, Some(Duration::from_secs(45)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache() {
        test::setup();

        let (layer, transport) = layer(Config::default());
        transport.respond("/jobs/", Duration::ZERO, Ok(jobs_page()));

        let params = json!({"page": 1});
        let read = || layer.fetch_value("/jobs/", Some(&params), TtlTier::Short, Default::default());

        read().await.unwrap();
        layer.invalidate("/jobs/", Some(&params)).unwrap();
        read().await.unwrap();
        layer.clear_cache();
        read().await.unwrap();

        assert_eq!(transport.calls("/jobs/"), 3);
    }
}
