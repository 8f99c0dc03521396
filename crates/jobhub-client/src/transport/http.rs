use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportRequest};
use crate::config::Config;
use crate::error::RequestError;
use crate::utils::futures::{m, measure};

/// A [`Transport`] that talks JSON over HTTP using [`reqwest`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    default_timeout: Duration,
}

/// Creates a [`reqwest::Client`] with the configured timeouts.
///
/// The overall timeout of the client is only a backstop. Requests normally carry their own
/// deadline, see [`TransportRequest::timeout`].
pub fn create_client(config: &Config) -> Result<reqwest::Client, RequestError> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(config.timeouts.connect)
        .timeout(config.timeouts.upload)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .map_err(|error| RequestError::network(&error))
}

impl HttpTransport {
    pub fn from_config(config: &Config) -> Result<Self, RequestError> {
        Ok(Self {
            client: create_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            auth_token: config.auth_token.clone(),
            default_timeout: config.timeouts.default,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn execute(
        client: reqwest::Client,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let request = request.build().map_err(|error| {
            tracing::error!(error = &error as &dyn std::error::Error, "Invalid request");
            RequestError::InternalError
        })?;
        let response = client.execute(request).await.map_err(|error| {
            if error.is_timeout() {
                RequestError::Timeout(timeout)
            } else {
                RequestError::network(&error)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::Status {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }

        let body = response.bytes().await.map_err(|error| {
            if error.is_timeout() {
                RequestError::Timeout(timeout)
            } else {
                RequestError::network(&error)
            }
        })?;
        if body.is_empty() || status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Transport for HttpTransport {
    fn call(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Value, RequestError>> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut builder = self
            .client
            .request(request.method.into(), self.url(&request.path))
            .timeout(timeout);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(query) = &request.query {
            builder = builder.query(query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::trace!(method = %request.method, path = %request.path, "Sending request");
        let execute = Self::execute(self.client.clone(), builder, timeout);

        let call = async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RequestError::Cancelled),
                result = execute => result,
            };
            if let Err(error) = &result {
                tracing::debug!(method = %request.method, path = %request.path, %error, "Request failed");
            }
            result
        };
        Box::pin(measure("http", m::request, call))
    }
}

/// Extracts a readable message from an error response body.
///
/// The backend reports errors as `{"detail": ...}`, some proxies use `{"message": ...}`. Anything
/// else is passed through as text, and an empty body falls back to the status' reason.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
        for field in ["detail", "message"] {
            match object.get(field) {
                Some(Value::String(message)) => return message.clone(),
                Some(Value::Null) | None => {}
                Some(other) => return other.to_string(),
            }
        }
    }

    let body = body.trim();
    if !body.is_empty() {
        return body.to_owned();
    }

    status
        .canonical_reason()
        .map_or_else(|| format!("HTTP {}", status.as_u16()), str::to_owned)
}
