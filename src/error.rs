//! Error types for the request client.
//!
//! Every failure a consumer can observe is a [`RequestError`]. The retry policy only looks at
//! [`RequestError::is_retryable`]; everything else about the variant is for the consumer.
//!
//! | Variant          | Source                                    | Retryable |
//! |------------------|-------------------------------------------|-----------|
//! | `Throttled`      | governor denied a retry attempt           | no        |
//! | `RateLimited`    | HTTP 429                                  | yes       |
//! | `ServerError`    | HTTP 5xx                                  | yes       |
//! | `Unauthorized`   | HTTP 401                                  | no        |
//! | `ClientError`    | any other non-2xx status                  | no        |
//! | `Transport`      | connect/timeout/exhaustion/body failures  | yes*      |
//! | `Decode`         | response body is not valid JSON           | no        |
//! | `InvalidRequest` | URL or body could not be built            | no        |
//!
//! \* `TransportErrorKind::Builder` is the one transport failure that is terminal.
//!
//! Aborted and abandoned calls are not errors: they resolve to `Ok(None)`.

use std::io;
use std::time::Duration;

/// Maximum number of characters of a response body kept in an error message.
pub const MAX_ERROR_BODY: usize = 200;

/// Coarse classification of a [`RequestError`], stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Throttled,
    RateLimited,
    ServerError,
    Unauthorized,
    ClientError,
    TransportFailure,
    Decode,
    InvalidRequest,
}

/// Unified error type surfaced by scopes and the client.
///
/// `Clone` because one physical call's result is fanned out to every deduplicated caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The governor refused a retry attempt because the endpoint was hit too recently.
    #[error("request to {endpoint} throttled; next attempt allowed in {retry_in:?}")]
    Throttled { endpoint: String, retry_in: Duration },
    /// HTTP 429.
    #[error("rate limited (HTTP 429): {message}")]
    RateLimited { message: String, retry_after: Option<Duration> },
    /// HTTP 5xx.
    #[error("server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },
    /// HTTP 401.
    #[error("unauthorized (HTTP 401): {message}")]
    Unauthorized { message: String },
    /// Any other non-2xx status.
    #[error("request failed (HTTP {status}): {message}")]
    ClientError { status: u16, message: String },
    /// The request never produced an HTTP response.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A 2xx response whose body is not JSON.
    #[error("invalid JSON response: {0}")]
    Decode(String),
    /// The request could not be constructed (bad URL, unserializable body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RequestError {
    /// Build the error for a non-2xx status. `body` is the raw response body.
    pub fn from_status(status: u16, body: &[u8], retry_after: Option<Duration>) -> Self {
        let message = error_message(status, body);
        match status {
            401 => RequestError::Unauthorized { message },
            429 => RequestError::RateLimited { message, retry_after },
            500..=599 => RequestError::ServerError { status, message },
            _ => RequestError::ClientError { status, message },
        }
    }

    /// Whether the retry policy may issue another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            RequestError::RateLimited { .. } | RequestError::ServerError { .. } => true,
            RequestError::Transport(e) => e.is_retryable(),
            RequestError::Throttled { .. }
            | RequestError::Unauthorized { .. }
            | RequestError::ClientError { .. }
            | RequestError::Decode(_)
            | RequestError::InvalidRequest(_) => false,
        }
    }

    /// Stable classification of the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RequestError::Throttled { .. } => ErrorClass::Throttled,
            RequestError::RateLimited { .. } => ErrorClass::RateLimited,
            RequestError::ServerError { .. } => ErrorClass::ServerError,
            RequestError::Unauthorized { .. } => ErrorClass::Unauthorized,
            RequestError::ClientError { .. } => ErrorClass::ClientError,
            RequestError::Transport(_) => ErrorClass::TransportFailure,
            RequestError::Decode(_) => ErrorClass::Decode,
            RequestError::InvalidRequest(_) => ErrorClass::InvalidRequest,
        }
    }

    /// HTTP status carried by the error, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::RateLimited { .. } => Some(429),
            RequestError::Unauthorized { .. } => Some(401),
            RequestError::ServerError { status, .. } | RequestError::ClientError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Server-requested wait carried by a 429, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RequestError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Pull a human-readable message out of an error body.
///
/// JSON bodies of the form `{"error": "..."}` or `{"message": "..."}` yield that field; anything
/// else falls back to the (truncated) body text, then to the bare status.
fn error_message(status: u16, body: &[u8]) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body) {
        for field in ["error", "message"] {
            if let Some(serde_json::Value::String(s)) = map.get(field) {
                return s.clone();
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("HTTP {}", status)
    } else {
        text.chars().take(MAX_ERROR_BODY).collect()
    }
}

/// What went wrong below HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Could not connect (DNS, refused, reset before a response).
    Connect,
    /// The attempt took longer than allowed.
    Timeout,
    /// The process ran out of sockets, file descriptors or memory.
    ResourceExhausted,
    /// The connection broke while reading the body.
    Body,
    /// The request could not be built. The only terminal kind.
    Builder,
    /// Any other network failure.
    Other,
}

/// A failure that happened before a complete HTTP response was received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("network failure ({kind:?}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != TransportErrorKind::Builder
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string();
        // Exhaustion hides behind hyper/io layers, so check the source chain before the
        // coarse reqwest flags.
        if let Some(io_err) = source_of::<io::Error>(&err) {
            if is_exhaustion(io_err) {
                return TransportError::new(TransportErrorKind::ResourceExhausted, message);
            }
        }
        let kind = if err.is_builder() {
            TransportErrorKind::Builder
        } else if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Other
        };
        TransportError::new(kind, message)
    }
}

/// EMFILE/ENFILE/ENOBUFS and allocation failures.
fn is_exhaustion(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    matches!(err.raw_os_error(), Some(23) | Some(24) | Some(105))
}

/// Walk `err`'s source chain looking for a `T`.
fn source_of<T: std::error::Error + 'static>(err: &dyn std::error::Error) -> Option<&T> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(found) = inner.downcast_ref::<T>() {
            return Some(found);
        }
        source = inner.source();
    }
    None
}

/// Errors produced while validating configuration or building a client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_concurrent must be > 0")]
    ZeroConcurrency,
    #[error("max_delay ({max:?}) must be >= base_delay ({base:?})")]
    MaxDelayBelowBase { base: Duration, max: Duration },
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
    #[error("invalid default header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("failed to build HTTP transport: {0}")]
    Transport(String),
}
