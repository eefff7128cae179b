#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # apiguard
//!
//! A resilient HTTP/JSON request client for data-fetching views: throttling, a concurrency
//! ceiling, in-flight deduplication, bounded exponential-backoff retry and a lifecycle-aware
//! request scope.
//!
//! ## Features
//!
//! - **Request governor**: per-endpoint throttle window, global ceiling on distinct active
//!   endpoints, and one shared in-flight call per identical request
//! - **Retry policy** with exponential backoff, `Retry-After` support and a stable
//!   retryable/terminal error classification
//! - **Request scopes** with observable `data`/`loading`/`error` state and teardown that
//!   freezes state and aborts abandoned work
//! - **Pluggable transport**: any `tower::Service`; `reqwest` by default
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use apiguard::{ApiClient, ClientConfig, ScopeOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ApiClient::builder()
//!         .config(ClientConfig {
//!             base_url: Some("https://crm.example.com".parse()?),
//!             ..ClientConfig::default()
//!         })
//!         .build()?;
//!
//!     let scope = client.scope_with(
//!         ScopeOptions::new().on_error(|err| eprintln!("request failed: {}", err)),
//!     );
//!     let created = scope.post("/api/customers", &json!({"name": "Ada"})).await?;
//!     println!("{:?} (loading: {})", created, scope.is_loading());
//!
//!     scope.cleanup();
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod governor;
pub mod jitter;
pub mod prelude;
pub mod retry;
pub mod scope;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::Backoff;
pub use client::{ApiClient, ApiClientBuilder};
pub use config::ClientConfig;
pub use error::{ConfigError, ErrorClass, RequestError, TransportError, TransportErrorKind};
pub use governor::{Admission, AdmissionLimits, CallResult, RequestGovernor, RequestKey};
pub use jitter::Jitter;
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use scope::{RequestOptions, RequestScope, RequestState, ScopeOptions};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{ClientEvent, EventSink, LogSink, MemorySink, NullSink};
pub use transport::{ApiRequest, ApiResponse, BoxTransport, ReqwestTransport};
