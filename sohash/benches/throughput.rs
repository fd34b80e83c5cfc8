//! Benchmark: sohash throughput
//!
//! Single-threaded insert/find and multi-threaded mixed workloads.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use sohash::{Config, SoHashTable};
use std::sync::Arc;
use std::thread;

const SIZES: &[u32] = &[1_000, 10_000, 100_000];
const THREAD_COUNTS: &[u32] = &[1, 2, 4, 8];
const OPS_PER_THREAD: u32 = 10_000;

fn table() -> SoHashTable<u64> {
    SoHashTable::new(Config::new()).unwrap()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for &size in SIZES {
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::new("sohash", size), &size, |b, &size| {
            b.iter(|| {
                let table = table();
                for key in 0..size {
                    let _ = table.insert(black_box(key), black_box(u64::from(key)));
                }
                table
            });
        });
    }

    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");

    for &size in SIZES {
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::new("sohash", size), &size, |b, &size| {
            let table = table();
            for key in 0..size {
                let _ = table.insert(key, u64::from(key));
            }
            b.iter(|| {
                let mut sum = 0u64;
                for key in 0..size {
                    if let Some(entry) = table.find(black_box(key)) {
                        sum += entry.value().copied().unwrap_or(0);
                    }
                }
                sum
            });
        });
    }

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_remove");
    group.throughput(Throughput::Elements(u64::from(OPS_PER_THREAD) * 2));

    group.bench_function("sohash", |b| {
        let table = table();
        b.iter(|| {
            for key in 0..OPS_PER_THREAD {
                let _ = table.insert(black_box(key), 0);
                let _ = table.remove(black_box(key));
            }
        });
    });

    group.finish();
}

/// 80% finds, 10% inserts, 10% removes over a shared key range.
fn bench_concurrent_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_mixed");

    for &threads in THREAD_COUNTS {
        group.throughput(Throughput::Elements(u64::from(threads * OPS_PER_THREAD)));
        group.bench_with_input(BenchmarkId::new("sohash", threads), &threads, |b, &threads| {
            let table = Arc::new(table());
            for key in 0..OPS_PER_THREAD {
                let _ = table.insert(key, u64::from(key));
            }
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let table = Arc::clone(&table);
                        thread::spawn(move || {
                            for i in 0..OPS_PER_THREAD {
                                let key = i.wrapping_mul(2_654_435_761).wrapping_add(t) % OPS_PER_THREAD;
                                match i % 10 {
                                    0 => {
                                        let _ = table.insert(key, u64::from(i));
                                    }
                                    1 => {
                                        let _ = table.remove(key);
                                    }
                                    _ => {
                                        black_box(table.find(key).is_some());
                                    }
                                }
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_find,
    bench_churn,
    bench_concurrent_mixed
);
criterion_main!(benches);
