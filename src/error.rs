use std::fmt;

use crate::TaskKey;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// A configuration value was rejected at the call site.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The handler option could not be resolved to a callable identity.
    #[error("invalid handler: {0}")]
    InvalidHandler(String),
    /// No response was obtained (connect failure, timeout, broken body).
    #[error("connection error ({kind}): {message}")]
    Connection {
        kind: ConnectionErrorKind,
        message: String,
    },
    /// A response was obtained but represents a failure.
    #[error("http error {status}: {body}")]
    Response { status: u16, body: String },
    /// A batch was aborted by the failure of one of its tasks.
    #[error("batch aborted by task {key}: {source}")]
    Batch {
        /// Key of the task that aborted the batch.
        key: TaskKey,
        /// Terminal error of that task.
        source: Box<RequestError>,
    },
    /// Handler output or cached value could not be (de)serialized.
    #[error("decode error: {0}")]
    Decode(String),
    /// The cache store failed.
    #[error("cache error: {0}")]
    Cache(String),
}

/// Phase in which a connection-level failure happened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionErrorKind {
    Connect,
    Timeout,
    Request,
    Body,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Request => "request",
            Self::Body => "body",
        };
        f.write_str(name)
    }
}

impl RequestError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn invalid_handler(message: impl Into<String>) -> Self {
        Self::InvalidHandler(message.into())
    }

    pub(crate) fn timeout(message: impl Into<String>) -> Self {
        Self::Connection {
            kind: ConnectionErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// Whether the default retry predicate treats this failure as transient.
    ///
    /// Every connection failure is retryable. Responses are retryable when the
    /// status is a server error (5xx), `408 Request Timeout` or
    /// `429 Too Many Requests`.
    pub fn is_retryable_by_default(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Response { status, .. } => {
                (500..600).contains(status) || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// HTTP status carried by a `Response` failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ConnectionErrorKind::Timeout
        } else if err.is_connect() {
            ConnectionErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            ConnectionErrorKind::Body
        } else {
            ConnectionErrorKind::Request
        };
        Self::Connection {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
