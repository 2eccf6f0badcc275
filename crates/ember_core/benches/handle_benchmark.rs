//! # Handle and Storage Benchmark
//!
//! Hot paths behind every handle dereference:
//! - handle table allocate/resolve/deallocate churn
//! - compact vs stable component lookup
//! - removal with deferred flush
//!
//! Run with: `cargo bench --package ember_core --bench handle_benchmark`

// Benchmarks don't need docs
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ember_core::{Component, ComponentStorage, ComponentTypeId, GameObjectHandle, HandleTable, StoragePolicy};

const COUNT: usize = 100_000;

#[derive(Default)]
struct Payload {
    value: [f32; 4],
}
impl Component for Payload {}

fn owner() -> GameObjectHandle {
    GameObjectHandle::new(0, 0, 1)
}

fn bench_table_churn(c: &mut Criterion) {
    c.bench_function("handle_table_churn_100k", |b| {
        let mut table: HandleTable<u64> = HandleTable::with_capacity(1, COUNT);
        b.iter(|| {
            let handles: Vec<_> = (0..COUNT as u64).map(|i| table.allocate(i)).collect();
            let mut sum = 0u64;
            for &handle in &handles {
                sum += table.resolve(handle).copied().unwrap_or_default();
            }
            for handle in handles {
                table.deallocate(handle);
            }
            black_box(sum)
        });
    });
}

fn bench_component_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("component_lookup");
    for policy in [StoragePolicy::Compact, StoragePolicy::Stable] {
        let mut storage = ComponentStorage::<Payload>::new(ComponentTypeId(0), policy, true);
        let handles: Vec<_> = (0..COUNT).map(|_| storage.create(owner(), Payload::default())).collect();
        // Remove every third entry so compact storage has moved things around
        for handle in handles.iter().step_by(3) {
            storage.destroy(*handle);
        }
        group.bench_with_input(BenchmarkId::from_parameter(format!("{policy:?}")), &handles, |b, handles| {
            b.iter(|| {
                let mut sum = 0.0f32;
                for &handle in handles {
                    if let Some(payload) = storage.resolve(handle) {
                        sum += payload.value[0];
                    }
                }
                black_box(sum)
            });
        });
    }
    group.finish();
}

fn bench_deferred_removal(c: &mut Criterion) {
    c.bench_function("defer_destroy_and_flush_10k", |b| {
        b.iter(|| {
            let mut storage = ComponentStorage::<Payload>::new(ComponentTypeId(0), StoragePolicy::Compact, true);
            let handles: Vec<_> = (0..10_000).map(|_| storage.create(owner(), Payload::default())).collect();
            for handle in handles.into_iter().step_by(2) {
                storage.defer_destroy(handle);
            }
            black_box(storage.flush_removals())
        });
    });
}

criterion_group!(benches, bench_table_churn, bench_component_lookup, bench_deferred_removal);
criterion_main!(benches);
