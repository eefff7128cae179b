//! Shared fixtures: a scripted in-memory backend and client constructors.
#![allow(dead_code)]

use apiguard::telemetry::MemorySink;
use apiguard::{
    ApiClient, ApiRequest, ApiResponse, ClientConfig, Sleeper, TransportError, TransportErrorKind,
};
use futures::future::BoxFuture;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::Service;

pub const BASE: &str = "http://crm.test";

/// One scripted answer.
#[derive(Debug, Clone)]
pub struct Reply {
    /// 0 means "no HTTP response": the attempt fails with a connect error.
    status: u16,
    body: Value,
    delay: Duration,
    retry_after: Option<u64>,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body, delay: Duration::ZERO, retry_after: None }
    }

    pub fn status(status: u16) -> Self {
        Self::json(status, json!({"error": format!("status {}", status)}))
    }

    pub fn network_error() -> Self {
        Self::json(0, Value::Null)
    }

    /// Answer only after `delay` (tokio time).
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

#[derive(Debug, Default)]
struct Backend {
    /// target -> replies; the last one repeats.
    routes: HashMap<String, Vec<Reply>>,
    served: HashMap<String, usize>,
    hits: Vec<(String, String, Instant)>,
    in_flight: HashMap<String, usize>,
    peak_in_flight: usize,
}

/// In-memory backend keyed by `path?query`. Unknown targets answer 404.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    backend: Arc<Mutex<Backend>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, target: &str, replies: Vec<Reply>) -> Self {
        self.backend.lock().unwrap().routes.insert(target.to_owned(), replies);
        self
    }

    /// Physical calls that reached `target`.
    pub fn hits(&self, target: &str) -> usize {
        self.backend.lock().unwrap().hits.iter().filter(|(_, t, _)| t == target).count()
    }

    pub fn total_hits(&self) -> usize {
        self.backend.lock().unwrap().hits.len()
    }

    /// When each call to `target` arrived.
    pub fn hit_times(&self, target: &str) -> Vec<Instant> {
        self.backend
            .lock()
            .unwrap()
            .hits
            .iter()
            .filter(|(_, t, _)| t == target)
            .map(|(_, _, at)| *at)
            .collect()
    }

    pub fn methods(&self, target: &str) -> Vec<String> {
        self.backend
            .lock()
            .unwrap()
            .hits
            .iter()
            .filter(|(_, t, _)| t == target)
            .map(|(m, _, _)| m.clone())
            .collect()
    }

    /// Largest number of distinct targets ever served at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.backend.lock().unwrap().peak_in_flight
    }

    fn begin(&self, method: &str, target: &str) -> Option<Reply> {
        let mut backend = self.backend.lock().unwrap();
        backend.hits.push((method.to_owned(), target.to_owned(), Instant::now()));
        *backend.in_flight.entry(target.to_owned()).or_insert(0) += 1;
        backend.peak_in_flight = backend.peak_in_flight.max(backend.in_flight.len());

        let served = backend.served.entry(target.to_owned()).or_insert(0);
        let n = *served;
        *served += 1;
        backend.routes.get(target).map(|replies| replies[n.min(replies.len() - 1)].clone())
    }
}

/// Leaves the in-flight set when the response is produced or the call is dropped.
struct InFlight {
    backend: Arc<Mutex<Backend>>,
    target: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut backend) = self.backend.lock() {
            if let Some(count) = backend.in_flight.get_mut(&self.target) {
                *count -= 1;
                if *count == 0 {
                    backend.in_flight.remove(&self.target);
                }
            }
        }
    }
}

fn target(req: &ApiRequest) -> String {
    match req.url.query() {
        Some(q) => format!("{}?{}", req.url.path(), q),
        None => req.url.path().to_owned(),
    }
}

impl Service<ApiRequest> for ScriptedTransport {
    type Response = ApiResponse;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<ApiResponse, TransportError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let target = target(&req);
        let reply = self.begin(req.method.as_str(), &target);
        let guard = InFlight { backend: self.backend.clone(), target };
        Box::pin(async move {
            let _guard = guard;
            let reply = reply.unwrap_or_else(|| Reply::status(404));
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            if reply.status == 0 {
                return Err(TransportError::new(TransportErrorKind::Connect, "connection refused"));
            }
            let mut response =
                ApiResponse::json(StatusCode::from_u16(reply.status).unwrap(), &reply.body);
            if let Some(secs) = reply.retry_after {
                response.headers.insert(RETRY_AFTER, HeaderValue::from(secs));
            }
            Ok(response)
        })
    }
}

/// Default client settings against [`BASE`].
pub fn config() -> ClientConfig {
    ClientConfig { base_url: Some(BASE.parse().unwrap()), ..ClientConfig::default() }
}

pub fn client<S>(transport: ScriptedTransport, config: ClientConfig, sleeper: S) -> (ApiClient, MemorySink)
where
    S: Sleeper + 'static,
{
    let sink = MemorySink::new();
    let client = ApiClient::builder()
        .config(config)
        .transport(transport)
        .sleeper(sleeper)
        .sink(Arc::new(sink.clone()))
        .build()
        .unwrap();
    (client, sink)
}
