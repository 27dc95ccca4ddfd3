use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use scopecrab::{LruStore, Period, Quota, RateLimiter};
use std::hint::black_box;
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("failed to build tokio runtime")
}

fn limiter(requests: i64, burst: i64, max_keys: i64) -> RateLimiter<LruStore> {
    RateLimiter::new(
        LruStore::builder().max_keys(max_keys).build(),
        Quota::new(requests, Period::Minute, burst).expect("valid quota"),
    )
}

fn benchmark_core_rate_limiter(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("core_rate_limiter");
    group.throughput(Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("single_key_allowed", |b| {
        let limiter = limiter(10_000, 1_000, 0);

        b.to_async(&rt).iter(|| async {
            let (allowed, _result) = limiter
                .rate_limit(black_box("test_key"), black_box(1), black_box(SystemTime::now()))
                .await
                .unwrap();
            black_box(allowed)
        });
    });

    group.bench_function("rotating_keys_100", |b| {
        let limiter = limiter(1_000, 100, 0);
        let mut counter = 0u64;

        b.to_async(&rt).iter(|| {
            let key = format!("key_{}", counter % 100);
            counter += 1;
            let limiter = &limiter;
            async move {
                let (allowed, _result) = limiter
                    .rate_limit(black_box(&key), black_box(1), black_box(SystemTime::now()))
                    .await
                    .unwrap();
                black_box(allowed)
            }
        });
    });

    // Denials skip the store write
    group.bench_function("single_key_denied", |b| {
        let limiter = limiter(10, 5, 0);
        rt.block_on(async {
            for _ in 0..10 {
                limiter
                    .rate_limit("exhausted_key", 1, SystemTime::now())
                    .await
                    .unwrap();
            }
        });

        b.to_async(&rt).iter(|| async {
            let (allowed, _result) = limiter
                .rate_limit(
                    black_box("exhausted_key"),
                    black_box(1),
                    black_box(SystemTime::now()),
                )
                .await
                .unwrap();
            black_box(allowed)
        });
    });

    group.finish();
}

fn benchmark_lru_pressure(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lru_pressure");
    group.throughput(Throughput::Elements(1));

    // Key space larger than, equal to and smaller than the store bound
    for (num_keys, max_keys) in [(10_000u64, 1_000i64), (10_000, 10_000), (1_000, 0)] {
        group.bench_with_input(
            format!("keys_{num_keys}_max_{max_keys}"),
            &num_keys,
            |b, &num_keys| {
                let limiter = limiter(1_000, 100, max_keys);
                let mut counter = 0u64;

                b.to_async(&rt).iter(|| {
                    let key = format!("key_{}", counter % num_keys);
                    counter += 1;
                    let limiter = &limiter;
                    async move {
                        let (allowed, _result) = limiter
                            .rate_limit(black_box(&key), black_box(1), black_box(SystemTime::now()))
                            .await
                            .unwrap();
                        black_box(allowed)
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_core_rate_limiter, benchmark_lru_pressure);
criterion_main!(benches);
