//! Store and retry-policy benchmarks.
//!
//! ## Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench --package drover-queue
//!
//! # Run one group
//! cargo bench --package drover-queue -- memory_store
//! ```
//!
//! ## Benchmark Categories
//!
//! 1. **Retry policy**: backoff computation with and without jitter
//! 2. **Memory store**: push, claim and complete cycles at different depths

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use drover_queue::{JobRecord, JobStore, MemoryJobStore, RetryPolicy};
use std::time::Duration;
use tokio::runtime::Runtime;

const QUEUE: &str = "bench";
const LOCK_TTL: Duration = Duration::from_secs(30);

fn benchmark_retry_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_policy");

    let plain = RetryPolicy::exponential(10).without_jitter();
    group.bench_function("next_delay/no_jitter", |b| {
        b.iter(|| {
            for attempt in 0..10 {
                black_box(plain.next_delay(black_box(attempt)));
            }
        })
    });

    let jittered = RetryPolicy::exponential(10);
    group.bench_function("next_delay/jitter", |b| {
        b.iter(|| {
            for attempt in 0..10 {
                black_box(jittered.next_delay(black_box(attempt)));
            }
        })
    });

    group.finish();
}

fn benchmark_memory_store(c: &mut Criterion) {
    let runtime = Runtime::new().expect("Failed to build runtime");
    let mut group = c.benchmark_group("memory_store");
    group.throughput(Throughput::Elements(1));

    for depth in [0usize, 1_000, 10_000] {
        let store = MemoryJobStore::new();
        runtime.block_on(async {
            let now = Utc::now();
            for i in 0..depth {
                let job = JobRecord::new(QUEUE, vec![0; 64], (i % 4) as u8 + 1, 3, now, now);
                store.push(job, now).await.expect("push failed");
            }
        });

        group.bench_with_input(
            BenchmarkId::new("push_claim_complete", depth),
            &store,
            |b, store| {
                b.to_async(&runtime).iter(|| async {
                    let now = Utc::now();
                    // Highest priority so the claim returns this job.
                    let job = JobRecord::new(QUEUE, vec![0; 64], 0, 3, now, now);
                    let id = job.id.clone();
                    store.push(job, now).await.expect("push failed");
                    let claimed = store
                        .claim_next(QUEUE, LOCK_TTL, now)
                        .await
                        .expect("claim failed")
                        .expect("job missing");
                    let token = claimed.lock_token.unwrap_or_default();
                    black_box(store.complete(QUEUE, &id, &token).await.expect("complete failed"));
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_retry_policy, benchmark_memory_store);
criterion_main!(benches);
