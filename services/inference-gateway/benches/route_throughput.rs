/// Routing throughput benchmarks
///
/// Benchmarks:
/// 1. Production route (single candidate) through the in-memory store
/// 2. A/B split route (open test lookup + random pick)
///
/// Run with: cargo bench --bench route_throughput

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use inference_gateway::model::{NewAbTest, Status};
use inference_gateway::{AbTestController, FixedPredictor, MemoryStore, RecordStore, Registration, RegistryBuilder, Router};
use serde_json::json;

fn registration(name: &str, status: Status) -> Registration {
    Registration {
        endpoint_name: "income_classifier".into(),
        name: name.into(),
        status,
        version: "0.0.1".into(),
        owner: "bench".into(),
        description: name.into(),
        code_reference: String::new(),
    }
}

async fn setup() -> Router {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let mut builder = RegistryBuilder::new(store.clone());
    builder.register(registration("logistic regression", Status::Production), Arc::new(FixedPredictor::new("<=50K", 0.55))).await.unwrap();
    let rf = builder.register(registration("random forest", Status::Testing), Arc::new(FixedPredictor::new("<=50K", 0.6))).await.unwrap();
    let et = builder.register(registration("extra trees", Status::Testing), Arc::new(FixedPredictor::new(">50K", 0.6))).await.unwrap();
    let router = Router::new(store.clone(), builder.build());
    AbTestController::new(store)
        .open_test(NewAbTest { title: "bench".into(), created_by: "bench".into(), model_version_id_1: rf, model_version_id_2: et })
        .await
        .unwrap();
    router
}

fn bench_route(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = rt.block_on(setup());
    let payload = json!({"age": 37, "workclass": "Private", "hours-per-week": 40});

    let mut group = c.benchmark_group("route");
    group.throughput(Throughput::Elements(1));
    for (name, status) in [("production", Status::Production), ("ab_testing", Status::AbTesting)] {
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| router.route("income_classifier", status, None, payload.clone()));
        });
    }
    group.finish();
}

fn bench_missing_candidates(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = rt.block_on(setup());
    c.bench_function("route_no_algorithm_available", |b| {
        b.to_async(&rt).iter(|| router.route("income_classifier", Status::Staging, None, json!({})));
    });
}

criterion_group!(benches, bench_route, bench_missing_candidates);
criterion_main!(benches);
