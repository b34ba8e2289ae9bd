use criterion::{Criterion, black_box, criterion_group, criterion_main};
use event_bus::{EventType, Topology, binding_matches, routing_key};

fn bench_routing_key(c: &mut Criterion) {
    c.bench_function("routing_key", |b| {
        b.iter(|| routing_key(black_box("Inventory"), black_box("InventoryUnavailable")))
    });
}

fn bench_binding_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("binding_matches");
    group.bench_function("literal", |b| {
        b.iter(|| {
            binding_matches(
                black_box("payment.payment.processed"),
                black_box("payment.payment.processed"),
            )
        })
    });
    group.bench_function("hash_wildcard", |b| {
        b.iter(|| binding_matches(black_box("#.failed"), black_box("payment.payment.failed")))
    });
    group.finish();
}

fn bench_topology_route(c: &mut Criterion) {
    let topology = Topology::sale_saga();
    let keys: Vec<String> = EventType::KNOWN
        .iter()
        .filter_map(|t| t.default_aggregate_type().map(|a| routing_key(a, t.as_str())))
        .collect();

    c.bench_function("route_all_known_events", |b| {
        b.iter(|| {
            keys.iter()
                .map(|key| topology.route(black_box(key)).count())
                .sum::<usize>()
        })
    });
}

criterion_group!(
    benches,
    bench_routing_key,
    bench_binding_match,
    bench_topology_route
);
criterion_main!(benches);
