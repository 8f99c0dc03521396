use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use jobhub_client::RequestError;
use jobhub_client::transport::{HttpTransport, Method, Transport, TransportRequest};

use crate::{AUTH_TOKEN, MockBackend, setup, test_config};

fn transport(backend: &MockBackend) -> HttpTransport {
    setup();
    HttpTransport::from_config(&test_config(backend)).unwrap()
}

async fn call(transport: &HttpTransport, request: TransportRequest) -> Result<serde_json::Value, RequestError> {
    transport.call(request, CancellationToken::new()).await
}

#[tokio::test]
async fn test_get_with_query() {
    let backend = MockBackend::new();
    let transport = transport(&backend);

    let request = TransportRequest::get("/jobs/").with_query(Some(json!({"page": 2})));
    let page = call(&transport, request).await.unwrap();

    assert_eq!(page["page"], "2");
    assert_eq!(page["total"], 2);
    assert_eq!(backend.all_hits(), [("/jobs/?page=2".to_owned(), 1)]);
}

#[tokio::test]
async fn test_post_with_auth() {
    let backend = MockBackend::new();
    let transport = transport(&backend);

    let body = json!({"job_id": 7, "cover_letter": "Hello"});
    let request = TransportRequest::new(Method::Post, "/echo/applications").with_body(Some(body.clone()));
    let echo = call(&transport, request).await.unwrap();

    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["path"], "applications");
    assert_eq!(echo["authorization"], format!("Bearer {AUTH_TOKEN}"));
    assert_eq!(echo["body"], body);
}

#[tokio::test]
async fn test_status_errors() {
    let backend = MockBackend::new();
    let transport = transport(&backend);

    for status in [404, 422, 500, 503] {
        let request = TransportRequest::get(format!("/respond_statuscode/{status}/jobs"));
        let result = call(&transport, request).await;
        assert_eq!(
            result,
            Err(RequestError::Status {
                status,
                message: format!("Responded with {status}"),
            })
        );
    }
}

#[tokio::test]
async fn test_empty_and_malformed_bodies() {
    let backend = MockBackend::new();
    let transport = transport(&backend);

    let request = TransportRequest::new(Method::Delete, "/no_content/jobs/42");
    assert_eq!(call(&transport, request).await, Ok(serde_json::Value::Null));

    let request = TransportRequest::get("/garbage_data/not-json");
    let result = call(&transport, request).await;
    assert!(matches!(result, Err(RequestError::Malformed(_))), "{result:?}");
}

#[tokio::test]
async fn test_timeout() {
    let backend = MockBackend::new();
    let transport = transport(&backend);

    let timeout = Duration::from_millis(200);
    let request = TransportRequest::get("/delay/1h/jobs").with_timeout(timeout);
    assert_eq!(call(&transport, request).await, Err(RequestError::Timeout(timeout)));
}

#[tokio::test]
async fn test_cancel() {
    let backend = MockBackend::new();
    let transport = transport(&backend);

    let cancel = CancellationToken::new();
    let request = TransportRequest::get("/delay/1h/jobs");
    let call = transport.call(request, cancel.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    assert_eq!(call.await, Err(RequestError::Cancelled));
}

#[tokio::test]
async fn test_connection_refused() {
    setup();
    let config = jobhub_client::config::Config {
        base_url: "http://127.0.0.1:1".to_owned(),
        ..Default::default()
    };
    let transport = HttpTransport::from_config(&config).unwrap();

    let result = call(&transport, TransportRequest::get("/jobs/")).await;
    assert!(matches!(result, Err(RequestError::Network(_))), "{result:?}");
}
