//! The network boundary of the request layer.
//!
//! The layer does not care how requests reach the backend. All it needs is a [`Transport`] that
//! answers with JSON and reports failures as [`RequestError`]s, with statuses preserved and
//! cancellations distinguished from timeouts.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::RequestError;

mod http;

pub use http::HttpTransport;

/// The HTTP method of a [`TransportRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Patch => Self::PATCH,
            Method::Delete => Self::DELETE,
        }
    }
}

/// A single request to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    /// The path relative to the base URL, such as `/jobs/`.
    pub path: String,
    /// Query parameters, which must serialize as a flat map.
    pub query: Option<Value>,
    /// The JSON body.
    pub body: Option<Value>,
    /// A deadline for this request, overriding the transport's default.
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn with_query(mut self, query: Option<Value>) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Issues requests to the backend.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends `request` and returns the decoded JSON response.
    ///
    /// A response without a body decodes to [`Value::Null`]. Once `cancel` is cancelled, the
    /// request is aborted and the call fails with [`RequestError::Cancelled`].
    fn call(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Value, RequestError>>;
}
