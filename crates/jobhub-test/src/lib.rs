//! Helpers for testing the request layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`MockBackend`], make sure that it is held until all requests to it have
//!    been made. Dropping it stops the server, and all connections to it will fail. To avoid
//!    this, assign it to a variable: `let backend = MockBackend::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Query, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json};
use axum::routing::{any, get};
use axum::Router;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `jobhub_client` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("jobhub_client=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

/// A fake JobHub backend that counts every request it receives.
///
/// Routes:
///
///  - `/jobs/`: a page of job listings, echoing the `page` query parameter.
///  - `/echo/*path`: echoes the method, path, query, authorization header and body of any request.
///  - `/flaky/:failures/*tail`: answers `503` for the first `failures` hits of a URI, then `200`.
///  - `/delay/:time/*tail`: answers after the given [humantime](humantime::parse_duration) delay.
///  - `/respond_statuscode/:num/*tail`: answers with the given status and a `detail` message.
///  - `/no_content/*tail`: answers `204` without a body.
///  - `/garbage_data/*tail`: answers `200` with the tail as plain text.
pub struct MockBackend {
    server: Server,
    hits: Hits,
}

impl MockBackend {
    pub fn new() -> Self {
        let hits = Hits::default();

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let flaky = {
            let hits = hits.clone();
            move |OriginalUri(uri), extract::Path((failures, _)): extract::Path<(usize, String)>| {
                let hits = hits.clone();
                async move {
                    let seen = hits.lock().unwrap().get(&uri.to_string()).copied();
                    if seen.unwrap_or_default() <= failures {
                        let body = json!({"detail": "Service temporarily unavailable"});
                        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
                    } else {
                        (StatusCode::OK, Json(json!({"ok": true})))
                    }
                }
            }
        };

        let router = Router::new()
            .route(
                "/jobs/",
                get(|Query(query): Query<BTreeMap<String, String>>| async move {
                    let page = query.get("page").map_or("1", String::as_str).to_owned();
                    Json(json!({
                        "jobs": ["Rust Engineer", "Site Reliability Engineer"],
                        "total": 2,
                        "page": page,
                    }))
                }),
            )
            .route(
                "/echo/*path",
                any(
                    |method: axum::http::Method,
                     extract::Path(path): extract::Path<String>,
                     Query(query): Query<BTreeMap<String, String>>,
                     headers: HeaderMap,
                     body: String| async move {
                        let authorization = headers
                            .get(header::AUTHORIZATION)
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_owned);
                        let body = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
                        Json(json!({
                            "method": method.as_str(),
                            "path": path,
                            "query": query,
                            "authorization": authorization,
                            "body": body,
                        }))
                    },
                ),
            )
            .route("/flaky/:failures/*tail", get(flaky))
            .route(
                "/delay/:time/*tail",
                get(
                    |extract::Path((time, _)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        Json(json!({"delayed": time}))
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        let status =
                            StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                        let detail = format!("Responded with {}", status.as_u16());
                        (status, Json(json!({ "detail": detail })))
                    },
                ),
            )
            .route(
                "/no_content/*tail",
                any(|| async { StatusCode::NO_CONTENT.into_response() }),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The total number of requests since the last call, which resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Requests per URI since the last call, which resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// The base URL to configure the request layer with.
    pub fn base_url(&self) -> String {
        self.server.url("")
    }

    pub fn url(&self, path: &str) -> String {
        self.server.url(path)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}
