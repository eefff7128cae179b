//! A dashboard with three panels loading from an in-process fake backend.
//!
//! The customer list and the sidebar ask for the same page at the same time and share one
//! call; the stats panel hits a flaky endpoint that recovers on the third attempt; the
//! proposals panel is closed before its slow request returns.
//!
//! Run with `RUST_LOG=debug cargo run --example customer_dashboard` to see client events.

use apiguard::{
    ApiClient, ApiRequest, ApiResponse, ClientConfig, ScopeOptions, TransportError,
};
use reqwest::StatusCode;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let stats_calls = Arc::new(AtomicUsize::new(0));
    let backend = {
        let stats_calls = stats_calls.clone();
        tower::service_fn(move |req: ApiRequest| {
            let stats_calls = stats_calls.clone();
            async move {
                let response = match req.url.path() {
                    "/api/customers" => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        ApiResponse::json(StatusCode::OK, &json!([{"id": 1, "name": "Ada"}]))
                    }
                    "/api/stats" if stats_calls.fetch_add(1, Ordering::SeqCst) < 2 => {
                        ApiResponse::json(StatusCode::INTERNAL_SERVER_ERROR, &json!({"error": "warming up"}))
                    }
                    "/api/stats" => ApiResponse::json(StatusCode::OK, &json!({"open_proposals": 4})),
                    "/api/proposals" => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        ApiResponse::json(StatusCode::OK, &json!([]))
                    }
                    _ => ApiResponse::json(StatusCode::NOT_FOUND, &json!({"error": "no such route"})),
                };
                Ok::<_, TransportError>(response)
            }
        })
    };

    let client = ApiClient::builder()
        .config(ClientConfig {
            base_url: Some("http://crm.internal".parse()?),
            throttle_interval: Duration::from_millis(50),
            base_delay: Duration::from_millis(100),
            ..ClientConfig::default()
        })
        .transport(backend)
        .build()?;

    let list = client.scope();
    let sidebar = client.scope();
    let (a, b) = tokio::join!(list.get("/api/customers?page=1"), sidebar.get("/api/customers?page=1"));
    println!("list: {:?}\nsidebar: {:?}", a?, b?);

    let stats = client.scope_with(
        ScopeOptions::new()
            .on_success(|v| println!("stats loaded: {}", v))
            .on_error(|e| println!("stats failed: {}", e)),
    );
    stats.get("/api/stats").await?;
    println!("stats endpoint was called {} times", stats_calls.load(Ordering::SeqCst));

    let proposals = client.scope();
    let (result, ()) = tokio::join!(proposals.get("/api/proposals"), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        proposals.cleanup();
    });
    println!("closed proposals panel: {:?}, state {:?}", result?, proposals.state());
    println!("governor after teardown: {:?}", client.governor());
    Ok(())
}
