use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use jobhub_client::breaker::{DependencyId, FallbackPolicy, Outcome};
use jobhub_client::config::{TimeoutTier, TtlTier};
use jobhub_client::transport::Method;
use jobhub_client::{RequestError, RequestOptions};

use crate::{AUTH_TOKEN, MockBackend, setup_layer};

#[derive(Debug, Deserialize)]
struct JobsPage {
    jobs: Vec<String>,
    total: u32,
    page: String,
}

#[tokio::test]
async fn test_cached_reads() {
    let backend = MockBackend::new();
    let layer = setup_layer(&backend, |_| {});

    let params = json!({"page": 3});
    for _ in 0..3 {
        let page: JobsPage = layer
            .fetch_json("/jobs/", Some(&params), TtlTier::Short, Default::default())
            .await
            .unwrap();
        assert_eq!(page.page, "3");
        assert_eq!(page.total, 2);
        assert_eq!(page.jobs.len(), 2);
    }
    assert_eq!(backend.accesses(), 1);

    let options = RequestOptions::default().skip_cache();
    layer
        .fetch_value("/jobs/", Some(&params), TtlTier::Short, options)
        .await
        .unwrap();
    assert_eq!(backend.accesses(), 1);
}

#[tokio::test]
async fn test_concurrent_reads() {
    let backend = MockBackend::new();
    let layer = setup_layer(&backend, |_| {});

    let reads = (0..5).map(|_| {
        layer.fetch_value::<()>("/delay/100ms/jobs", None, TtlTier::Short, Default::default())
    });
    for value in futures::future::join_all(reads).await {
        assert_eq!(*value.unwrap(), json!({"delayed": "100ms"}));
    }
    assert_eq!(backend.accesses(), 1);
}

#[tokio::test]
async fn test_retries_flaky_backend() {
    let backend = MockBackend::new();
    let layer = setup_layer(&backend, |_| {});

    let value = layer
        .fetch_value::<()>("/flaky/2/jobs", None, TtlTier::Short, Default::default())
        .await
        .unwrap();

    assert_eq!(*value, json!({"ok": true}));
    assert_eq!(backend.accesses(), 3);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let backend = MockBackend::new();
    let layer = setup_layer(&backend, |config| config.retry.max_retries = 2);

    let result = layer
        .fetch_value::<()>("/respond_statuscode/503/jobs", None, TtlTier::Short, Default::default())
        .await;

    assert_eq!(result.unwrap_err().status(), Some(503));
    assert_eq!(backend.accesses(), 3);
}

#[tokio::test]
async fn test_client_error_not_retried() {
    let backend = MockBackend::new();
    let layer = setup_layer(&backend, |_| {});

    let result = layer
        .fetch_value::<()>("/respond_statuscode/422/jobs", None, TtlTier::Short, Default::default())
        .await;

    let error = result.unwrap_err();
    assert_eq!(error.status(), Some(422));
    assert_eq!(error.user_message(), "Responded with 422");
    assert_eq!(backend.accesses(), 1);
}

#[tokio::test]
async fn test_timeout() {
    let backend = MockBackend::new();
    let layer = setup_layer(&backend, |config| config.retry.max_retries = 0);

    let options = RequestOptions::default().with_timeout(TimeoutTier::Fast);
    let result = layer
        .fetch_value::<()>("/delay/1h/jobs", None, TtlTier::Short, options)
        .await;

    assert_eq!(result, Err(RequestError::Timeout(Duration::from_millis(200))));
}

#[tokio::test]
async fn test_degradable_dependency() {
    let backend = MockBackend::new();
    let layer = setup_layer(&backend, |config| config.retry.max_retries = 0);

    let ai = DependencyId::new("ai");
    for _ in 0..5 {
        let outcome = layer
            .fetch_degradable::<String, ()>(
                &ai,
                "/respond_statuscode/500/ai/summary",
                None,
                TtlTier::AiResults,
                FallbackPolicy::OnOpenOrFailure,
                || "Summary unavailable".to_owned(),
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Fallback("Summary unavailable".to_owned()));
    }

    // The circuit opened after three failures.
    assert_eq!(backend.accesses(), 3);
    assert!(layer.degradable().breaker().is_open(&ai));
}

#[tokio::test]
async fn test_send() {
    let backend = MockBackend::new();
    let layer = setup_layer(&backend, |_| {});

    let body = json!({"title": "Rust Engineer"});
    for _ in 0..2 {
        let echo = layer
            .send(Method::Put, "/echo/jobs/42", Some(body.clone()), Default::default())
            .await
            .unwrap();
        assert_eq!(echo["method"], "PUT");
        assert_eq!(echo["body"], body);
        assert_eq!(echo["authorization"], format!("Bearer {AUTH_TOKEN}"));
    }
    assert_eq!(backend.accesses(), 2);
}
