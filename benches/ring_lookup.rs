use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use moltbot_pool_rs::hash_ring::{fnv1a, HashRing};
use moltbot_pool_rs::StickyRouter;

fn ring_with_workers(n: usize) -> HashRing {
    let mut ring = HashRing::new(150);
    for i in 0..n {
        ring.add_worker(&format!("worker-{i}"));
    }
    ring
}

fn bench_ring_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_lookup");
    for worker_count in [4usize, 16, 64] {
        let ring = ring_with_workers(worker_count);
        group.bench_with_input(
            BenchmarkId::from_parameter(worker_count),
            &worker_count,
            |b, _| {
                let mut i: u32 = 0;
                b.iter(|| {
                    i = i.wrapping_add(1);
                    black_box(ring.lookup(black_box(i)))
                });
            },
        );
    }
    group.finish();
}

fn bench_fnv1a(c: &mut Criterion) {
    c.bench_function("fnv1a_user_id", |b| {
        b.iter(|| black_box(fnv1a(black_box("user-0123456789"))));
    });
}

fn bench_router_route_cached(c: &mut Criterion) {
    let router = StickyRouter::new(150);
    for i in 0..4 {
        router.add_worker(&format!("worker-{i}"));
    }
    router.route("user-hot").unwrap();

    c.bench_function("router_route_cache_hit", |b| {
        b.iter(|| black_box(router.route(black_box("user-hot")).unwrap()));
    });
}

fn bench_router_route_uncached(c: &mut Criterion) {
    let router = StickyRouter::new(150);
    for i in 0..4 {
        router.add_worker(&format!("worker-{i}"));
    }

    c.bench_function("router_route_cache_miss", |b| {
        let mut i: u64 = 0;
        b.iter(|| {
            i += 1;
            let user_id = format!("user-{i}");
            black_box(router.route(black_box(&user_id)).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_ring_lookup,
    bench_fnv1a,
    bench_router_route_cached,
    bench_router_route_uncached
);
criterion_main!(benches);
