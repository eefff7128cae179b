//! Admission and deduplication seen through the public client API.
mod common;

use apiguard::{ClientEvent, ClientConfig, ScopeOptions, TrackingSleeper};
use common::{client, config, Reply, ScriptedTransport};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn concurrent_identical_gets_share_one_call() {
    let transport = ScriptedTransport::new().route(
        "/api/customers?page=1",
        vec![Reply::json(200, json!([{"id": 1, "name": "Ada"}])).after(Duration::from_millis(100))],
    );
    let (client, sink) = client(transport.clone(), config(), TrackingSleeper::new());
    let list = client.scope();
    let sidebar = client.scope();

    let (a, b) = tokio::join!(list.get("/api/customers?page=1"), sidebar.get("/api/customers?page=1"));

    assert_eq!(transport.hits("/api/customers?page=1"), 1);
    assert_eq!(a, b);
    assert_eq!(a.unwrap(), Some(json!([{"id": 1, "name": "Ada"}])));
    assert_eq!(list.data(), sidebar.data());
    assert_eq!(sink.count(|e| matches!(e, ClientEvent::Deduplicated { .. })), 1);
    assert_eq!(client.governor().pending_count(), 0);
    assert_eq!(client.governor().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn same_url_different_method_is_not_deduplicated() {
    let transport = ScriptedTransport::new().route(
        "/api/proposals/7",
        vec![Reply::json(200, json!({"id": 7})).after(Duration::from_millis(100))],
    );
    let cfg = ClientConfig { throttle_interval: Duration::ZERO, ..config() };
    let (client, sink) = client(transport.clone(), cfg, TrackingSleeper::new());
    let scope = client.scope();

    let (get, delete) = tokio::join!(scope.get("/api/proposals/7"), scope.delete("/api/proposals/7"));

    assert!(get.is_ok() && delete.is_ok());
    let mut methods = transport.methods("/api/proposals/7");
    methods.sort();
    assert_eq!(methods, vec!["DELETE".to_owned(), "GET".to_owned()]);
    assert_eq!(sink.count(|e| matches!(e, ClientEvent::Deduplicated { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn attempts_to_one_endpoint_are_spaced_by_throttle_window() {
    let transport = ScriptedTransport::new()
        .route("/api/products", vec![Reply::json(200, json!([]))])
        .route("/api/employees", vec![Reply::json(200, json!([]))]);
    let (client, sink) = client(transport.clone(), config(), TrackingSleeper::new());
    let scope = client.scope();

    scope.get("/api/products").await.unwrap();
    scope.get("/api/products").await.unwrap();
    scope.get("/api/employees").await.unwrap();

    let times = transport.hit_times("/api/products");
    assert_eq!(times.len(), 2);
    assert!(times[1] - times[0] >= Duration::from_millis(1000));

    // A different endpoint is not held back by the products window.
    let employees = transport.hit_times("/api/employees");
    assert_eq!(employees[0], times[1]);
    assert_eq!(sink.count(|e| matches!(e, ClientEvent::ThrottleWait { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_attempts_to_one_endpoint_are_spaced() {
    let transport =
        ScriptedTransport::new().route("/api/proposals/7", vec![Reply::json(200, json!({"id": 7}))]);
    let (client, sink) = client(transport.clone(), config(), TrackingSleeper::new());
    let scope = client.scope();

    let (get, delete) = tokio::join!(scope.get("/api/proposals/7"), scope.delete("/api/proposals/7"));

    assert!(get.is_ok() && delete.is_ok());
    let times = transport.hit_times("/api/proposals/7");
    assert_eq!(times.len(), 2);
    assert!(times[1] - times[0] >= Duration::from_secs(1));
    assert_eq!(sink.count(|e| matches!(e, ClientEvent::ThrottleWait { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrency_ceiling_bounds_distinct_active_endpoints() {
    let mut transport = ScriptedTransport::new();
    let paths: Vec<String> = (0..6).map(|i| format!("/api/customers/{}", i)).collect();
    for (i, path) in paths.iter().enumerate() {
        transport = transport.route(
            path,
            vec![Reply::json(200, json!({"id": i})).after(Duration::from_millis(100))],
        );
    }
    let cfg = ClientConfig { max_concurrent: 2, ..config() };
    let (client, sink) = client(transport.clone(), cfg, TrackingSleeper::new());
    let scopes: Vec<_> = paths.iter().map(|_| client.scope()).collect();

    let results = futures::future::join_all(
        scopes.iter().zip(&paths).map(|(scope, path)| scope.get(path)),
    )
    .await;

    assert!(results.iter().all(|r| matches!(r, Ok(Some(_)))));
    assert_eq!(transport.total_hits(), 6);
    assert_eq!(transport.peak_in_flight(), 2);
    assert!(sink.count(|e| matches!(e, ClientEvent::SlotWait { .. })) > 0);
    assert_eq!(client.governor().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scope_ceiling_override_applies() {
    let mut transport = ScriptedTransport::new();
    for i in 0..3 {
        transport = transport.route(
            &format!("/api/uploads/{}", i),
            vec![Reply::json(200, json!(null)).after(Duration::from_millis(50))],
        );
    }
    let (client, _sink) = client(transport.clone(), config(), TrackingSleeper::new());
    let scope = client.scope_with(ScopeOptions::new().max_concurrent(1));

    let (a, b, c) = tokio::join!(
        scope.get("/api/uploads/0"),
        scope.get("/api/uploads/1"),
        scope.get("/api/uploads/2")
    );

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(transport.peak_in_flight(), 1);
}
