//! The HTTP seam.
//!
//! A transport is any `tower::Service<ApiRequest, Response = ApiResponse, Error = TransportError>`.
//! Production code uses [`ReqwestTransport`]; tests plug in `tower::service_fn` closures that
//! script responses, so retry and deduplication behavior can be checked without a network.
//!
//! A transport performs exactly one physical attempt. It never retries and never interprets
//! the status code; that is the retry policy's job.

use crate::error::{ConfigError, RequestError, TransportError};
use crate::governor::RequestKey;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::Service;
use url::Url;

/// Longest `Retry-After` the client will honor.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Type-erased transport stored by the client.
pub type BoxTransport = BoxCloneService<ApiRequest, ApiResponse, TransportError>;

/// Erase a transport service into a [`BoxTransport`].
pub fn boxed<S>(service: S) -> BoxTransport
where
    S: Service<ApiRequest, Response = ApiResponse, Error = TransportError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    BoxCloneService::new(service)
}

/// One request as handed to the transport.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self { method, url, headers: HeaderMap::new(), body: None }
    }

    /// Serialize `body` as JSON and set `Content-Type: application/json`.
    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, RequestError> {
        let bytes =
            serde_json::to_vec(body).map_err(|e| RequestError::InvalidRequest(e.to_string()))?;
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(bytes);
        Ok(self)
    }

    /// The endpoint key: the full URL.
    pub fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    /// Deduplication identity.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.method.as_str(), self.url.as_str(), self.body.clone())
    }
}

/// A complete HTTP response, body already read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self { status, headers: HeaderMap::new(), body: body.into() }
    }

    /// A response with a JSON body.
    pub fn json(status: StatusCode, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    /// Server-requested delay from a numeric `Retry-After` header, capped at [`MAX_RETRY_AFTER`].
    pub fn retry_after(&self) -> Option<Duration> {
        let secs = self.headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
        Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
    }

    /// 2xx bodies parse as JSON (an empty body is `null`); any other status is an error,
    /// whatever the body says.
    pub fn into_json(self) -> Result<Value, RequestError> {
        if !self.status.is_success() {
            return Err(RequestError::from_status(
                self.status.as_u16(),
                &self.body,
                self.retry_after(),
            ));
        }
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body).map_err(|e| RequestError::Decode(e.to_string()))
    }
}

/// Transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ConfigError> {
        let client =
            reqwest::Client::builder().build().map_err(|e| ConfigError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (proxies, TLS roots, connect timeouts).
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Service<ApiRequest> for ReqwestTransport {
    type Response = ApiResponse;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<ApiResponse, TransportError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = client.request(request.method, request.url).headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?.to_vec();
            Ok(ApiResponse { status, headers, body })
        })
    }
}
