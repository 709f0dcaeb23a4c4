//! Benchmarks for refstream
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn benchmark_queue_operations(c: &mut Criterion) {
    use refstream::pool::WorkQueue;

    c.bench_function("queue_put_poll", |b| {
        let queue = WorkQueue::new(10000);

        b.iter(|| {
            queue.put(black_box(42u64)).unwrap();
            let received = queue.poll().unwrap();
            black_box(received);
        })
    });
}

fn benchmark_pool_throughput(c: &mut Criterion) {
    use refstream::config::PoolConfig;
    use refstream::error::WorkerError;
    use refstream::pool::WorkerPool;

    c.bench_function("pool_10k_items", |b| {
        let pool: WorkerPool<u64, _> = WorkerPool::new(&PoolConfig::new(4, 8, 256), |_id| {
            Ok::<_, WorkerError>(|item: u64| {
                black_box(item.wrapping_mul(31));
            })
        })
        .unwrap();
        pool.prestart_core_workers();

        b.iter(|| {
            for item in 0..10_000 {
                pool.add_work(item).unwrap();
            }
            pool.join();
        });

        pool.shutdown_and_wait();
    });
}

fn benchmark_cache_put_drain(c: &mut Criterion) {
    use refstream::cache::{CacheEntry, CacheTableManager, ReferenceCache};
    use refstream::config::CacheConfig;

    let manager = CacheTableManager::temporary().unwrap();
    let config = CacheConfig {
        partitions: 4,
        capacity: 100_000,
        drain_factor: 0.5,
        batch_size: 1000,
        cache_dir: None,
    };

    c.bench_function("cache_put_drain_1k", |b| {
        let cache = ReferenceCache::new(&manager, &config).unwrap();
        let mut next = 0i64;

        b.iter(|| {
            for _ in 0..1000 {
                cache
                    .put(format!("gml_{}", next), CacheEntry::new(next, 0, 1))
                    .unwrap();
                next += 1;
            }
            black_box(cache.drain_all().unwrap());
        });
    });
}

fn benchmark_xlink_resolution(c: &mut Criterion) {
    use refstream::pipeline::{SyntheticConfig, SyntheticSource};
    use refstream::resolve::XlinkResolver;

    let units: Vec<_> = SyntheticSource::new(SyntheticConfig::new(200, 11)).collect();

    c.bench_function("xlink_resolve_200_units", |b| {
        let mut resolver = XlinkResolver::new();

        b.iter(|| {
            for unit in &units {
                let mut geometry = unit.geometry.clone();
                black_box(resolver.resolve_unit(&unit.id, &mut geometry).ok());
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_queue_operations,
    benchmark_pool_throughput,
    benchmark_cache_put_drain,
    benchmark_xlink_resolution
);
criterion_main!(benches);
