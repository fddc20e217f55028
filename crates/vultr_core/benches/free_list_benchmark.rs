//! # Free-List Allocator Benchmark
//!
//! Measures allocate / free / reallocate against a single region, with and
//! without a fragmented index.
//!
//! Run with: `cargo bench --package vultr_core`

// Benchmarks don't need docs
#![allow(missing_docs)]
#![allow(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use vultr_core::{FreeListAllocator, LockedFreeList, MemoryArena};

/// Region handed to each allocator (16MB).
const REGION_SIZE: usize = 16 * 1024 * 1024;
/// Payload alignment used throughout.
const ALIGNMENT: usize = 16;

/// Benchmark: allocate then free the same size over and over.
fn bench_allocate_free_pair(c: &mut Criterion) {
    let arena = MemoryArena::new(REGION_SIZE, ALIGNMENT).unwrap();
    let mut heap = FreeListAllocator::init(&arena, REGION_SIZE, ALIGNMENT).unwrap();

    let mut group = c.benchmark_group("allocate_free_pair");
    for size in [32, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let ptr = heap.allocate(black_box(size));
                unsafe { heap.free(ptr) };
            });
        });
    }
    group.finish();
}

/// Benchmark: best-fit lookups with thousands of distinct free sizes.
fn bench_fragmented_best_fit(c: &mut Criterion) {
    let arena = MemoryArena::new(REGION_SIZE, ALIGNMENT).unwrap();
    let mut heap = FreeListAllocator::init(&arena, REGION_SIZE, ALIGNMENT).unwrap();

    // Punch holes of growing size between guard blocks.
    let mut holes = Vec::new();
    for i in 0..2_000 {
        holes.push(heap.allocate(32 + (i % 500) * 16));
        let _guard = heap.allocate(32);
    }
    for ptr in holes {
        unsafe { heap.free(ptr) };
    }

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    c.bench_function("fragmented_best_fit", |b| {
        b.iter(|| {
            let ptr = heap.allocate(rng.gen_range(32..8_000));
            unsafe { heap.free(black_box(ptr)) };
        });
    });
}

/// Benchmark: a realistic mix of allocations, frees and reallocations.
fn bench_random_churn(c: &mut Criterion) {
    c.bench_function("random_churn_10k", |b| {
        b.iter(|| {
            let arena = MemoryArena::new(REGION_SIZE / 64, ALIGNMENT).unwrap();
            let mut heap = FreeListAllocator::init(&arena, REGION_SIZE / 64, ALIGNMENT).unwrap();
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            let mut live = Vec::with_capacity(1024);

            for _ in 0..10_000 {
                if live.is_empty() || rng.gen_bool(0.55) {
                    if let Ok(ptr) = heap.try_allocate(rng.gen_range(16..1024)) {
                        live.push(ptr);
                    }
                } else if rng.gen_bool(0.8) {
                    let ptr = live.swap_remove(rng.gen_range(0..live.len()));
                    unsafe { heap.free(ptr) };
                } else {
                    let index = rng.gen_range(0..live.len());
                    if let Ok(ptr) = unsafe { heap.try_reallocate(live[index], rng.gen_range(16..2048)) } {
                        live[index] = ptr;
                    }
                }
            }
            black_box(heap.stats())
        });
    });
}

/// Benchmark: uncontended lock overhead.
fn bench_locked_pair(c: &mut Criterion) {
    let arena = MemoryArena::new(REGION_SIZE, ALIGNMENT).unwrap();
    let heap = LockedFreeList::new(FreeListAllocator::init(&arena, REGION_SIZE, ALIGNMENT).unwrap());

    c.bench_function("locked_allocate_free_pair", |b| {
        b.iter(|| {
            let ptr = heap.allocate(black_box(256));
            unsafe { heap.free(ptr) };
        });
    });
}

criterion_group!(
    benches,
    bench_allocate_free_pair,
    bench_fragmented_best_fit,
    bench_random_churn,
    bench_locked_pair,
);
criterion_main!(benches);
