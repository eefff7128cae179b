//! Scope state transitions and teardown.
mod common;

use apiguard::{RequestState, ScopeOptions, TrackingSleeper};
use common::{client, config, Reply, ScriptedTransport};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn cleanup_freezes_state_and_suppresses_callbacks() {
    let transport = ScriptedTransport::new().route(
        "/api/customers",
        vec![Reply::json(200, json!([{"id": 1}])).after(Duration::from_secs(5))],
    );
    let (client, _sink) = client(transport.clone(), config(), TrackingSleeper::new());
    let callbacks = Arc::new(AtomicUsize::new(0));
    let scope = {
        let (ok, err) = (callbacks.clone(), callbacks.clone());
        client.scope_with(
            ScopeOptions::new()
                .on_success(move |_| {
                    ok.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_| {
                    err.fetch_add(1, Ordering::SeqCst);
                }),
        )
    };

    let (result, frozen) = tokio::join!(scope.get("/api/customers"), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = scope.state();
        scope.cleanup();
        snapshot
    });

    assert_eq!(result, Ok(None));
    assert!(frozen.loading);
    assert_eq!(frozen.data, None);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(scope.state(), frozen);
    assert_eq!(callbacks.load(Ordering::SeqCst), 0);
    assert_eq!(transport.hits("/api/customers"), 1);
    assert_eq!(client.governor().active_count(), 0);
    assert_eq!(client.governor().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cleanup_during_backoff_prevents_further_attempts() {
    let transport = ScriptedTransport::new().route("/api/flaky", vec![Reply::status(500)]);
    let (client, _sink) = client(transport.clone(), config(), TrackingSleeper::new());
    let scope = client.scope();

    let (result, ()) = tokio::join!(scope.get("/api/flaky"), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        scope.cleanup();
    });

    assert_eq!(result, Ok(None));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.hits("/api/flaky"), 1);
    assert_eq!(scope.error(), None);
    assert!(scope.is_loading(), "state stays frozen in Loading");
}

#[tokio::test(start_paused = true)]
async fn shared_call_survives_one_subscriber_leaving() {
    let transport = ScriptedTransport::new().route(
        "/api/customers?page=1",
        vec![Reply::json(200, json!([{"id": 1}])).after(Duration::from_secs(2))],
    );
    let (client, _sink) = client(transport.clone(), config(), TrackingSleeper::new());
    let leaving = client.scope();
    let staying = client.scope();

    let (gone, kept, ()) = tokio::join!(
        leaving.get("/api/customers?page=1"),
        staying.get("/api/customers?page=1"),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            leaving.cleanup();
        }
    );

    assert_eq!(gone, Ok(None));
    assert_eq!(kept, Ok(Some(json!([{"id": 1}]))));
    assert_eq!(transport.hits("/api/customers?page=1"), 1);
    assert_eq!(leaving.data(), None);
    assert_eq!(staying.data(), Some(json!([{"id": 1}])));
}

#[tokio::test(start_paused = true)]
async fn dropping_a_scope_aborts_its_lone_call() {
    let transport = ScriptedTransport::new().route(
        "/api/products",
        vec![Reply::json(200, json!([])).after(Duration::from_secs(10))],
    );
    let (client, _sink) = client(transport.clone(), config(), TrackingSleeper::new());

    let task = {
        let client = client.clone();
        tokio::spawn(async move {
            let scope = client.scope();
            scope.get("/api/products").await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.governor().active_count(), 1);
    assert_eq!(client.governor().pending_count(), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(client.governor().active_count(), 0);
    assert_eq!(client.governor().pending_count(), 0);
    assert_eq!(transport.peak_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn loading_and_active_requests_are_observable_mid_flight() {
    let transport = ScriptedTransport::new().route(
        "/api/employees",
        vec![Reply::json(200, json!([{"name": "Grace"}])).after(Duration::from_secs(1))],
    );
    let (client, _sink) = client(transport, config(), TrackingSleeper::new());
    let scope = client.scope();

    let (result, mid) = tokio::join!(scope.get("/api/employees"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        (scope.is_loading(), scope.active_requests())
    });

    assert!(result.is_ok());
    assert_eq!(mid, (true, 1));
    assert!(!scope.is_loading());
    assert_eq!(scope.active_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_loading_then_settled_state() {
    let transport = ScriptedTransport::new().route(
        "/api/proposals",
        vec![Reply::json(200, json!([{"id": 3}])).after(Duration::from_secs(1))],
    );
    let (client, _sink) = client(transport, config(), TrackingSleeper::new());
    let scope = client.scope();
    let mut rx = scope.subscribe();

    let (_, (loading, settled)) = tokio::join!(scope.get("/api/proposals"), async {
        rx.changed().await.unwrap();
        let loading = rx.borrow_and_update().loading;
        rx.changed().await.unwrap();
        let settled = rx.borrow_and_update().clone();
        (loading, settled)
    });

    assert!(loading);
    assert_eq!(
        settled,
        RequestState { data: Some(json!([{"id": 3}])), loading: false, error: None }
    );
}
