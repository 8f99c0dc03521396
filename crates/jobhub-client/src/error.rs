use std::time::Duration;

use humantime::format_duration;
use thiserror::Error;

/// HTTP status codes that indicate a transient condition on the backend.
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// An error that happens while issuing a request through the request layer.
///
/// All failures flowing through the cache, retry, timeout and circuit breaker layers use
/// this type. It is cheap to clone, so that every caller joining a deduplicated request
/// observes the very same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The backend answered with a non-success status code.
    ///
    /// The attached message is the one extracted from the response body.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    /// The request did not reach the backend, or the connection broke down.
    #[error("network error: {0}")]
    Network(String),
    /// The request did not finish within its deadline.
    #[error("request timed out after {}", human_duration(.0))]
    Timeout(Duration),
    /// The request was aborted by the caller.
    #[error("request cancelled")]
    Cancelled,
    /// The concurrency cap for a degradable dependency was reached.
    #[error("too many concurrent requests to {0}")]
    Overloaded(String),
    /// The response arrived, but could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// An unexpected error in the request layer itself.
    #[error("internal error")]
    InternalError,
}

fn human_duration(duration: &Duration) -> humantime::FormattedDuration {
    format_duration(*duration)
}

/// The class of a [`RequestError`], which decides how the layers react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A network error or a retryable status code.
    Transient,
    /// The deadline of a single attempt elapsed.
    Timeout,
    /// The caller aborted the request.
    Cancelled,
    /// A 4xx status that retrying will not fix.
    ClientError,
    /// Anything else. These are never retried.
    Unknown,
}

impl ErrorKind {
    /// Whether an error of this kind may succeed on a second attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }

    /// A short tag for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ClientError => "client_error",
            Self::Unknown => "unknown",
        }
    }
}

/// Classifies an error.
///
/// This is the only place that looks at the shape of a [`RequestError`]. The retry and
/// circuit breaker logic switch on the returned [`ErrorKind`].
pub fn classify(error: &RequestError, retryable_statuses: &[u16]) -> ErrorKind {
    match error {
        RequestError::Cancelled => ErrorKind::Cancelled,
        RequestError::Timeout(_) => ErrorKind::Timeout,
        RequestError::Network(_) => ErrorKind::Transient,
        RequestError::Status { status, .. } if retryable_statuses.contains(status) => {
            ErrorKind::Transient
        }
        RequestError::Status { status, .. } if (400..500).contains(status) => {
            ErrorKind::ClientError
        }
        RequestError::Status { .. }
        | RequestError::Overloaded(_)
        | RequestError::Malformed(_)
        | RequestError::InternalError => ErrorKind::Unknown,
    }
}

impl RequestError {
    /// Classifies this error using the [default retryable statuses](DEFAULT_RETRYABLE_STATUSES).
    pub fn kind(&self) -> ErrorKind {
        classify(self, DEFAULT_RETRYABLE_STATUSES)
    }

    /// The HTTP status of the response, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this error was caused by a caller-initiated abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A message that is suitable to be shown to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout(duration) => format!(
                "The request is taking longer than expected (timed out after {}). Please try again or check your connection.",
                format_duration(*duration)
            ),
            Self::Network(message) => message.clone(),
            Self::Status { message, .. } => message.clone(),
            Self::Cancelled => "The request was cancelled.".to_owned(),
            Self::Overloaded(_) => {
                "Too many concurrent requests. Please try again later.".to_owned()
            }
            Self::Malformed(_) | Self::InternalError => {
                "An unexpected error occurred. Please try again.".to_owned()
            }
        }
    }

    /// Builds a [`RequestError::Network`] from the innermost cause of `error`.
    pub(crate) fn network(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut error = error;
        while let Some(src) = error.source() {
            error = src;
        }
        Self::Network(error.to_string())
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(error: serde_json::Error) -> Self {
        Self::Malformed(error.to_string())
    }
}
