use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use nsqdelay::core::message::{encode_message, DelayedMessage};
use nsqdelay::core::store::{DelayStore, MemoryStore};

fn members(count: usize) -> Vec<(String, i64)> {
    (0..count)
        .map(|i| {
            let mut msg = DelayedMessage::new("t1", format!("payload-{i:08}"), 60);
            msg.id = format!("{i:016x}");
            // Spread scores over 100 seconds
            (encode_message(&msg).unwrap(), 1_000 + (i % 100) as i64)
        })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("memory_store_insert");

    for &size in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("insert", size), &size, |b, &size| {
            let batch = members(size);
            b.to_async(&rt).iter(|| async {
                let store = MemoryStore::new();
                for (member, score) in &batch {
                    store.insert(member, *score).await.unwrap();
                }
                black_box(store)
            });
        });
    }

    group.finish();
}

fn bench_pop_due(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("memory_store_pop_due");

    for &size in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("pop_half", size), &size, |b, &size| {
            let batch = members(size);
            b.to_async(&rt).iter(|| async {
                let store = MemoryStore::new();
                for (member, score) in &batch {
                    store.insert(member, *score).await.unwrap();
                }
                black_box(store.pop_due(1_049).await.unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_pop_due);
criterion_main!(benches);
