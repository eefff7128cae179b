use apiguard::governor::{AdmissionLimits, RequestGovernor, RequestKey};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::FutureExt;
use serde_json::json;
use std::time::Duration;

fn admission_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let governor = RequestGovernor::new();
    let limits = AdmissionLimits { throttle: Duration::ZERO, max_concurrent: 5 };

    c.bench_function("governor_try_start_release", |b| {
        b.to_async(&rt).iter(|| async {
            let guard = governor.try_start(black_box("https://crm/api/customers"), &limits, false);
            drop(black_box(guard));
        });
    });
}

fn throttled_rejection(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let governor = RequestGovernor::new();
    let limits = AdmissionLimits { throttle: Duration::from_secs(3600), max_concurrent: 5 };
    // Stamp the endpoint so every later check lands inside the window.
    rt.block_on(async { drop(governor.mark_started("https://crm/api/products")) });

    c.bench_function("governor_throttled_can_start", |b| {
        b.iter(|| black_box(governor.can_start(black_box("https://crm/api/products"), &limits)));
    });
}

fn dedup_join(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let governor = RequestGovernor::new();
    let key = RequestKey::new("GET", "https://crm/api/customers?page=1", None);

    c.bench_function("governor_join_or_register_settle", |b| {
        b.to_async(&rt).iter(|| async {
            let first = governor
                .join_or_register(key.clone(), |_| async { Ok(Some(json!({"ok": true}))) }.boxed());
            let second = governor.join_or_register(key.clone(), |_| futures::future::pending().boxed());
            let (a, b) = futures::join!(first.call(), second.call());
            black_box((a, b));
        });
    });
}

criterion_group!(benches, admission_throughput, throttled_rejection, dedup_join);
criterion_main!(benches);
