//! Performance benchmarks for fieldsync-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fieldsync_engine::{
    AuditQueue, DependencyGraph, FeatureKey, FeatureRef, FeatureStore, ServiceId, SyncItem,
};
use serde_json::json;

fn item(row: u64) -> SyncItem {
    SyncItem::create(
        FeatureRef::new(FeatureKey::new("survey", "trees", row)),
        json!({"species": "oak", "height": 12.5}),
        1000,
    )
}

fn bench_audit_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("audit_queue");

    group.bench_function("enqueue_distinct", |b| {
        let mut queue = AuditQueue::new();
        let mut row = 0u64;
        b.iter(|| {
            row += 1;
            queue.enqueue(black_box(item(row)))
        })
    });

    group.bench_function("enqueue_same_key", |b| {
        let mut queue = AuditQueue::new();
        b.iter(|| queue.enqueue(black_box(item(1))))
    });

    for size in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("drain", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let mut queue = AuditQueue::new();
                    for row in 0..size {
                        queue.enqueue(item(row));
                    }
                    queue
                },
                |mut queue| {
                    let items: Vec<SyncItem> = queue.ready().cloned().collect();
                    for sent in &items {
                        queue.begin(sent);
                        queue.acknowledge(sent, None);
                    }
                    queue
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("feature_store");

    group.bench_function("insert", |b| {
        let mut store = FeatureStore::new("survey");
        store.add_layer("trees");
        b.iter(|| store.insert("trees", black_box(json!({"n": 1})), 1000))
    });

    group.bench_function("snapshot_to_json", |b| {
        let mut store = FeatureStore::new("survey");
        store.add_layer("trees");
        for n in 0..1000 {
            let _ = store.insert("trees", json!({"n": n}), 1000);
        }
        b.iter(|| store.export_state().to_json())
    });

    group.finish();
}

fn bench_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_graph");

    for size in [10usize, 100, 500] {
        // Chain: service n depends on service n-1
        let mut graph = DependencyGraph::new();
        for n in 0..size {
            let deps = if n == 0 {
                vec![]
            } else {
                vec![ServiceId::new(format!("svc-{}", n - 1))]
            };
            let _ = graph.insert(ServiceId::new(format!("svc-{}", n)), deps);
        }
        let target = format!("svc-{}", size - 1);

        group.bench_with_input(BenchmarkId::new("plan_chain", size), &graph, |b, graph| {
            b.iter(|| graph.plan_start(black_box(&target)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_audit_queue, bench_store, bench_graph);
criterion_main!(benches);
