//! The request client: binds configuration, the governor, a transport and telemetry.
//!
//! ```rust,no_run
//! use apiguard::{ApiClient, ClientConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig {
//!     base_url: Some("https://crm.example.com".parse()?),
//!     ..ClientConfig::default()
//! };
//! let client = ApiClient::builder().config(config).build()?;
//!
//! let customers = client.scope();
//! if let Some(page) = customers.get("/api/customers?page=1").await? {
//!     println!("{}", page);
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use crate::error::{ConfigError, RequestError, TransportError};
use crate::governor::{AdmissionLimits, CallResult, RequestGovernor};
use crate::retry::RetryPolicy;
use crate::scope::{RequestOptions, RequestScope, ScopeOptions};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{ClientEvent, EventSink, LogSink};
use crate::transport::{self, ApiRequest, ApiResponse, BoxTransport, ReqwestTransport};
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use url::Url;

struct ClientInner {
    config: ClientConfig,
    headers: HeaderMap,
    governor: RequestGovernor,
    transport: Mutex<BoxTransport>,
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
}

/// Cheaply clonable handle to a configured client.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("config", &self.inner.config)
            .field("governor", &self.inner.governor)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl ApiClient {
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn governor(&self) -> &RequestGovernor {
        &self.inner.governor
    }

    /// The retry policy built from the client's configuration.
    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// A new scope with the client's defaults.
    pub fn scope(&self) -> RequestScope {
        RequestScope::new(self.clone(), ScopeOptions::default())
    }

    /// A new scope with per-consumer overrides and callbacks.
    pub fn scope_with(&self, options: ScopeOptions) -> RequestScope {
        RequestScope::new(self.clone(), options)
    }

    /// Resolve `path` against the base URL. Absolute URLs are used as given.
    pub fn resolve(&self, path: &str) -> Result<Url, RequestError> {
        match Url::parse(path) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.inner.config.base_url {
                Some(base) => base
                    .join(path)
                    .map_err(|e| RequestError::InvalidRequest(format!("{}: {}", path, e))),
                None => Err(RequestError::InvalidRequest(format!(
                    "relative url {} requires a base_url",
                    path
                ))),
            },
            Err(e) => Err(RequestError::InvalidRequest(format!("{}: {}", path, e))),
        }
    }

    /// Build the transport request: resolved URL, default headers, then per-request headers,
    /// then the JSON body.
    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        options: &RequestOptions,
    ) -> Result<ApiRequest, RequestError> {
        let mut request = ApiRequest::new(method, self.resolve(path)?);
        request.headers = self.inner.headers.clone();
        for (name, value) in &options.headers {
            request.headers.insert(name.clone(), value.clone());
        }
        match &options.body {
            Some(body) => request.with_json(body),
            None => Ok(request),
        }
    }

    /// Run one logical request with the client's defaults and no lifecycle.
    ///
    /// Identical requests already in flight are joined rather than repeated.
    pub async fn execute(&self, request: ApiRequest) -> CallResult {
        let limits = self.inner.config.limits();
        self.dispatch(request, self.inner.policy.clone(), limits, &CancellationToken::new()).await
    }

    /// Join or start the logical call for `request` and wait for it unless `cancel` fires.
    ///
    /// Cancelling only detaches this caller; the physical call is aborted once no subscriber
    /// remains.
    pub(crate) async fn dispatch(
        &self,
        request: ApiRequest,
        policy: RetryPolicy,
        limits: AdmissionLimits,
        cancel: &CancellationToken,
    ) -> CallResult {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let endpoint = request.endpoint().to_owned();
        let subscription = self.inner.governor.join_or_register(request.key(), |call_cancel| {
            let client = self.clone();
            async move { client.run(request, policy, limits, call_cancel).await }.boxed()
        });
        if subscription.joined_existing() {
            self.inner.sink.record(&ClientEvent::Deduplicated { endpoint });
        }

        let call = subscription.call();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            result = call => result,
        };
        drop(subscription);
        result
    }

    async fn run(
        self,
        request: ApiRequest,
        policy: RetryPolicy,
        limits: AdmissionLimits,
        cancel: CancellationToken,
    ) -> CallResult {
        let endpoint = request.endpoint().to_owned();
        let governor = self.inner.governor.clone();
        policy
            .execute(&governor, &endpoint, &limits, &cancel, || {
                let transport = self.transport();
                let request = request.clone();
                async move {
                    match transport.oneshot(request).await {
                        Ok(response) => response.into_json(),
                        Err(err) => Err(RequestError::from(err)),
                    }
                }
            })
            .await
    }

    fn transport(&self) -> BoxTransport {
        self.inner.transport.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Builder for [`ApiClient`].
pub struct ApiClientBuilder {
    config: ClientConfig,
    governor: Option<RequestGovernor>,
    transport: Option<BoxTransport>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
}

impl ApiClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            governor: None,
            transport: None,
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(LogSink),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing governor. Clients sharing a governor share throttle windows,
    /// the concurrency ceiling and deduplication.
    pub fn governor(mut self, governor: RequestGovernor) -> Self {
        self.governor = Some(governor);
        self
    }

    /// Replace the reqwest transport with any tower service.
    pub fn transport<S>(mut self, service: S) -> Self
    where
        S: Service<ApiRequest, Response = ApiResponse, Error = TransportError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.transport = Some(transport::boxed(service));
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<ApiClient, ConfigError> {
        self.config.validate()?;
        let headers = default_headers(&self.config)?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => transport::boxed(ReqwestTransport::new()?),
        };
        let policy = RetryPolicy::builder()
            .retries(self.config.retries)
            .backoff(self.config.backoff()?)
            .with_jitter(self.config.jitter)
            .attempt_timeout(self.config.attempt_timeout)
            .with_shared_sleeper(self.sleeper)
            .with_sink(self.sink.clone())
            .build();

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                headers,
                governor: self.governor.unwrap_or_default(),
                transport: Mutex::new(transport),
                policy,
                sink: self.sink,
            }),
        })
    }
}

impl Default for ApiClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_headers(config: &ClientConfig) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.default_headers {
        let invalid = |reason: String| ConfigError::InvalidHeader { name: name.clone(), reason };
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}
