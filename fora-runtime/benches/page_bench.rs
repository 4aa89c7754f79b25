//! Vector page benchmarks using criterion.
//!
//! Measures pagelet building, page serialization and the flatten/inflate
//! pipeline.
//!
//! Run with: cargo bench --bench page_bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fora_runtime::memory::{MemoryPool, VectorDataMemoryManager};
use fora_runtime::model::{Type, Value};
use fora_runtime::serialize::{SerializedObjectFlattener, SerializedObjectInflater};
use fora_runtime::vector::{PageletBuilder, VectorPage, VectorPageBuilder};

fn build_page(memory: &Arc<VectorDataMemoryManager>, pagelets: usize, per_pagelet: usize) -> Arc<VectorPage> {
    let mut page = VectorPageBuilder::new(memory);
    for p in 0..pagelets {
        let mut pagelet = PageletBuilder::new(memory);
        let raw = pagelet.append_uninitialized(&Type::int64(), per_pagelet).unwrap();
        for (i, slot) in raw.chunks_exact_mut(8).enumerate() {
            slot.copy_from_slice(&((p * per_pagelet + i) as i64).to_le_bytes());
        }
        page.append_pagelet(pagelet.freeze());
    }
    page.freeze()
}

/// Benchmark appending values to a pagelet
fn bench_pagelet_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("pagelet_append");
    let memory = VectorDataMemoryManager::unbounded(16);

    for &n in &[1_000usize, 10_000] {
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("packed_int64", n), &n, |b, &n| {
            b.iter(|| {
                let mut pagelet = PageletBuilder::new(&memory);
                for i in 0..n {
                    pagelet.append(&Value::Int64(i as i64)).unwrap();
                }
                black_box(pagelet.freeze())
            });
        });

        group.bench_with_input(BenchmarkId::new("boxed_strings", n), &n, |b, &n| {
            let values: Vec<Value> = (0..n).map(|i| Value::string(format!("s{i}"))).collect();
            b.iter(|| {
                let mut pagelet = PageletBuilder::new(&memory);
                for v in &values {
                    pagelet.append(v).unwrap();
                }
                black_box(pagelet.freeze())
            });
        });
    }

    group.finish();
}

/// Benchmark serialize + flatten and inflate + deserialize of whole pages
fn bench_page_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_roundtrip");
    let memory = VectorDataMemoryManager::unbounded(16);

    for &pagelets in &[1usize, 16] {
        let page = build_page(&memory, pagelets, 4096);
        let flat = SerializedObjectFlattener::flatten_once(&page.serialize());
        group.throughput(Throughput::Bytes(flat.total_byte_count() as u64));

        group.bench_with_input(BenchmarkId::new("serialize_flatten", pagelets), &page, |b, page| {
            b.iter(|| black_box(SerializedObjectFlattener::flatten_once(&page.serialize())));
        });

        let bytes = flat.to_contiguous().into_owned();
        group.bench_with_input(BenchmarkId::new("inflate_deserialize", pagelets), &bytes, |b, bytes| {
            b.iter(|| {
                let so = SerializedObjectInflater::inflate_once(bytes).unwrap();
                black_box(VectorPage::deserialize(&memory, &so).unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark best-fit pool churn
fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_pool");

    group.bench_function("alloc_free_mixed", |b| {
        let pool = MemoryPool::new(1 << 24, 16);
        b.iter(|| {
            let offsets: Vec<usize> = (0..256).map(|i| pool.allocate(64 + (i % 7) * 48).unwrap()).collect();
            let (odd, even): (Vec<_>, Vec<_>) = offsets.into_iter().enumerate().partition(|(i, _)| i % 2 == 1);
            for (_, offset) in odd {
                pool.free(offset);
            }
            let rest: Vec<usize> = (0..128).map(|_| pool.allocate(32).unwrap()).collect();
            black_box(pool.max_allocatable_block_size());
            for offset in rest.into_iter().chain(even.into_iter().map(|(_, o)| o)) {
                pool.free(offset);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pagelet_append, bench_page_roundtrip, bench_pool);
criterion_main!(benches);
