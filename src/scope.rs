//! Request scope: the per-consumer façade over the client.
//!
//! A view creates one scope, issues `get`/`post`/`put`/`delete` through it, and observes
//! `data`, `loading` and `error`. When the view goes away it calls [`RequestScope::cleanup`]
//! (or just drops the scope). After that:
//!
//! - the published state never changes again, whatever in-flight calls later return;
//! - in-flight throttle, slot and backoff waits for this scope end with `Ok(None)`;
//! - the scope's subscription to a shared call is released, and the physical call is aborted
//!   if no other scope is still waiting on it.
//!
//! Per call the state moves Idle → Loading → Succeeded | Failed | Abandoned. Entering Loading
//! clears the previous error; Abandoned leaves the state untouched.

use crate::backoff::Backoff;
use crate::client::ApiClient;
use crate::error::RequestError;
use crate::governor::{AdmissionLimits, CallResult};
use crate::retry::RetryPolicy;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Called with the value of every successful, non-null settlement.
pub type SuccessCallback = Arc<dyn Fn(&Value) + Send + Sync>;
/// Called with the error of every failed settlement.
pub type ErrorCallback = Arc<dyn Fn(&RequestError) + Send + Sync>;

/// Observable state of a scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestState {
    pub data: Option<Value>,
    pub loading: bool,
    pub error: Option<RequestError>,
}

/// Per-scope overrides of the client configuration, plus callbacks.
#[derive(Clone, Default)]
pub struct ScopeOptions {
    pub throttle_interval: Option<Duration>,
    /// Values below 1 are treated as 1.
    pub max_concurrent: Option<usize>,
    pub retries: Option<usize>,
    pub base_delay: Option<Duration>,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = Some(interval);
        self
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ScopeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeOptions")
            .field("throttle_interval", &self.throttle_interval)
            .field("max_concurrent", &self.max_concurrent)
            .field("retries", &self.retries)
            .field("base_delay", &self.base_delay)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Method-independent parts of a request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Serialized as JSON; also sets `Content-Type: application/json`.
    pub body: Option<Value>,
    /// Added on top of the client's default headers. Not part of the deduplication key.
    pub headers: HeaderMap,
}

impl RequestOptions {
    pub fn json(body: Value) -> Self {
        Self { body: Some(body), headers: HeaderMap::new() }
    }
}

/// Per-consumer request façade with observable state and teardown.
///
/// Not `Clone`: one scope belongs to one consumer. Dropping it performs [`cleanup`](Self::cleanup).
pub struct RequestScope {
    client: ApiClient,
    policy: RetryPolicy,
    limits: AdmissionLimits,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    state: watch::Sender<RequestState>,
    cancel: CancellationToken,
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("limits", &self.limits)
            .field("state", &*self.state.borrow())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl RequestScope {
    pub(crate) fn new(client: ApiClient, options: ScopeOptions) -> Self {
        let config = client.config();
        let limits = AdmissionLimits {
            throttle: options.throttle_interval.unwrap_or(config.throttle_interval),
            max_concurrent: options.max_concurrent.unwrap_or(config.max_concurrent).max(1),
        };
        let policy = if options.retries.is_some() || options.base_delay.is_some() {
            let base = options.base_delay.unwrap_or(config.base_delay);
            let backoff = match config.max_delay {
                Some(max) => Backoff::exponential(base).capped_at(max),
                None => Backoff::exponential(base),
            };
            client.policy().tuned(options.retries.unwrap_or(config.retries), backoff)
        } else {
            client.policy().clone()
        };
        let (state, _) = watch::channel(RequestState::default());

        Self {
            client,
            policy,
            limits,
            on_success: options.on_success,
            on_error: options.on_error,
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Issue a request and drive the scope's state machine.
    ///
    /// `Ok(None)` means the call was abandoned because the scope was torn down.
    pub async fn request(&self, method: Method, path: &str, options: RequestOptions) -> CallResult {
        if self.is_torn_down() {
            return Ok(None);
        }
        let request = match self.client.build_request(method, path, &options) {
            Ok(request) => request,
            Err(err) => {
                self.settle_failure(&err);
                return Err(err);
            }
        };

        self.transition(|state| {
            state.loading = true;
            state.error = None;
        });
        let result =
            self.client.dispatch(request, self.policy.clone(), self.limits, &self.cancel).await;

        match &result {
            Ok(Some(value)) => self.settle_success(value),
            // Abandoned; the scope is torn down and its state frozen.
            Ok(None) => {}
            Err(err) => self.settle_failure(err),
        }
        result
    }

    pub async fn get(&self, path: &str) -> CallResult {
        self.request(Method::GET, path, RequestOptions::default()).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> CallResult {
        let options = self.json_options(body)?;
        self.request(Method::POST, path, options).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> CallResult {
        let options = self.json_options(body)?;
        self.request(Method::PUT, path, options).await
    }

    pub async fn delete(&self, path: &str) -> CallResult {
        self.request(Method::DELETE, path, RequestOptions::default()).await
    }

    fn json_options<B: Serialize + ?Sized>(&self, body: &B) -> Result<RequestOptions, RequestError> {
        match serde_json::to_value(body) {
            Ok(value) => Ok(RequestOptions::json(value)),
            Err(e) => {
                let err = RequestError::InvalidRequest(e.to_string());
                self.settle_failure(&err);
                Err(err)
            }
        }
    }

    /// Tear the scope down. Idempotent.
    ///
    /// The token is cancelled while holding the state channel's write lock, so no state
    /// transition can land after this returns. Callbacks are skipped once the scope is torn
    /// down; one already running on another thread is not interrupted.
    pub fn cleanup(&self) {
        let mut first = false;
        self.state.send_if_modified(|_| {
            first = !self.cancel.is_cancelled();
            self.cancel.cancel();
            false
        });
        if first {
            tracing::debug!(
                active = self.client.governor().active_count(),
                pending = self.client.governor().pending_count(),
                "request scope torn down"
            );
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> RequestState {
        self.state.borrow().clone()
    }

    /// Watch the state; the receiver sees every applied transition.
    pub fn subscribe(&self) -> watch::Receiver<RequestState> {
        self.state.subscribe()
    }

    pub fn data(&self) -> Option<Value> {
        self.state.borrow().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn error(&self) -> Option<RequestError> {
        self.state.borrow().error.clone()
    }

    /// Distinct endpoints with an attempt in flight across the whole governor.
    pub fn active_requests(&self) -> usize {
        self.client.governor().active_count()
    }

    /// Apply `update` unless the scope has been torn down. Returns whether it was applied.
    fn transition(&self, update: impl FnOnce(&mut RequestState)) -> bool {
        self.state.send_if_modified(|state| {
            if self.cancel.is_cancelled() {
                return false;
            }
            update(state);
            true
        })
    }

    fn settle_success(&self, value: &Value) {
        let applied = self.transition(|state| {
            state.data = Some(value.clone());
            state.loading = false;
            state.error = None;
        });
        if applied && !value.is_null() && !self.is_torn_down() {
            if let Some(callback) = &self.on_success {
                callback(value);
            }
        }
    }

    fn settle_failure(&self, err: &RequestError) {
        let applied = self.transition(|state| {
            state.loading = false;
            state.error = Some(err.clone());
        });
        if applied && !self.is_torn_down() {
            if let Some(callback) = &self.on_error {
                callback(err);
            }
        }
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.cleanup();
    }
}
