//! # Free-List Property Tests
//!
//! Drives the allocator through long deterministic workloads and checks the
//! structural invariants after every single operation.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use vultr_core::{FreeListAllocator, MemoryArena, MemoryConfig, MemoryError};

/// A live allocation plus the byte pattern written into it.
struct Live {
    ptr: NonNull<u8>,
    len: usize,
    tag: u8,
}

fn fill(live: &Live) {
    unsafe { live.ptr.as_ptr().write_bytes(live.tag, live.len) };
}

fn check(live: &Live) {
    let bytes = unsafe { std::slice::from_raw_parts(live.ptr.as_ptr(), live.len) };
    assert!(
        bytes.iter().all(|&b| b == live.tag),
        "allocation {:p} lost its contents",
        live.ptr
    );
}

fn assert_layout(heap: &FreeListAllocator<'_>) {
    heap.validate().unwrap();

    let mut spanned = 0;
    let mut prev_free = false;
    for block in heap.blocks() {
        assert!(!(prev_free && !block.allocated), "adjacent free blocks");
        prev_free = !block.allocated;
        spanned += heap.header_size() + block.size;
    }
    assert_eq!(spanned, heap.capacity());
}

/// An out-of-memory answer is only honest when no free block could hold
/// the request.
fn assert_nothing_fits(heap: &FreeListAllocator<'_>, len: usize) {
    let needed = heap.aligned_size(len);
    assert!(
        !heap.largest_free_block().is_some_and(|largest| largest >= needed),
        "request of {len} bytes refused while {:?} is free",
        heap.largest_free_block()
    );
}

/// Test: random allocate / free / reallocate keeps every invariant.
#[test]
fn test_random_churn_keeps_invariants() {
    let arena = MemoryArena::new(1024 * 1024, 16).unwrap();
    let mut heap = FreeListAllocator::init(&arena, 256 * 1024, 16).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut live: Vec<Live> = Vec::new();

    for step in 0..4_000u32 {
        let roll = rng.gen_range(0..10);

        if roll < 5 || live.is_empty() {
            let len = rng.gen_range(1..=700);
            match heap.try_allocate(len) {
                Ok(ptr) => {
                    let entry = Live {
                        ptr,
                        len,
                        tag: (step % 251) as u8,
                    };
                    fill(&entry);
                    live.push(entry);
                }
                Err(MemoryError::OutOfMemory { .. }) => assert_nothing_fits(&heap, len),
                Err(err) => panic!("unexpected error: {err}"),
            }
        } else if roll < 8 {
            let entry = live.swap_remove(rng.gen_range(0..live.len()));
            check(&entry);
            unsafe { heap.free(entry.ptr) };
        } else {
            let index = rng.gen_range(0..live.len());
            let new_len = rng.gen_range(1..=1400);
            let entry = &mut live[index];
            check(entry);

            match unsafe { heap.try_reallocate(entry.ptr, new_len) } {
                Ok(ptr) => {
                    entry.ptr = ptr;
                    // Surviving prefix must be intact before rewriting it.
                    entry.len = entry.len.min(new_len);
                    check(entry);
                    entry.len = new_len;
                    fill(entry);
                }
                Err(MemoryError::OutOfMemory { .. }) => {
                    check(entry);
                    assert_nothing_fits(&heap, new_len);
                }
                Err(err) => panic!("unexpected error: {err}"),
            }
        }

        assert_layout(&heap);
    }

    for entry in live.drain(..) {
        check(&entry);
        unsafe { heap.free(entry.ptr) };
    }

    assert_eq!(heap.used(), 0);
    assert_eq!(heap.blocks().count(), 1);
    assert_layout(&heap);
}

/// Test: freeing in reverse, forward and interleaved order always collapses
/// the region back into a single free block.
#[test]
fn test_every_free_order_collapses_region() {
    let arena = MemoryArena::new(256 * 1024, 16).unwrap();

    for order in 0..3 {
        let mut heap = FreeListAllocator::init(&arena, 64 * 1024, 16).unwrap();
        let mut ptrs: Vec<_> = (0..64).map(|i| heap.allocate(16 + i * 8)).collect();

        match order {
            0 => ptrs.reverse(),
            1 => {}
            _ => {
                let (even, odd): (Vec<_>, Vec<_>) =
                    ptrs.iter().enumerate().partition(|(i, _)| i % 2 == 0);
                ptrs = even.into_iter().chain(odd).map(|(_, &p)| p).collect();
            }
        }

        for ptr in ptrs {
            unsafe { heap.free(ptr) };
            assert_layout(&heap);
        }

        let stats = heap.stats();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_bytes, heap.capacity() - heap.header_size());
    }
}

/// Test: many blocks of the same size share one index node.
#[test]
fn test_same_size_blocks_share_index_node() {
    let arena = MemoryArena::new(256 * 1024, 16).unwrap();
    let mut heap = FreeListAllocator::init(&arena, 128 * 1024, 16).unwrap();

    let mut singles = Vec::new();
    for _ in 0..50 {
        singles.push(heap.allocate(48));
        let _guard = heap.allocate(96);
    }
    for &ptr in &singles {
        unsafe { heap.free(ptr) };
    }

    let summary = heap.index_summary();
    assert!(summary.contains(&(48, 50)));
    // One node per distinct size: 48 plus the tail.
    assert_eq!(summary.len(), 2);
    assert_layout(&heap);

    // Drain the chain back out in arbitrary order.
    for _ in 0..50 {
        let ptr = heap.allocate(48);
        assert!(singles.contains(&ptr));
        assert_layout(&heap);
    }
    assert_eq!(heap.index_summary().len(), 1);
}

/// Test: exhaustion is reported without corrupting state, and the region is
/// fully usable afterwards.
#[test]
fn test_exhaustion_then_recovery() {
    let arena = MemoryArena::new(64 * 1024, 16).unwrap();
    let mut heap = FreeListAllocator::init(&arena, 8 * 1024, 16).unwrap();

    let mut ptrs = Vec::new();
    loop {
        match heap.try_allocate(200) {
            Ok(ptr) => ptrs.push(ptr),
            Err(err) => {
                assert!(matches!(err, MemoryError::OutOfMemory { .. }));
                break;
            }
        }
    }
    assert!(!ptrs.is_empty());
    assert_layout(&heap);

    for ptr in ptrs {
        unsafe { heap.free(ptr) };
    }

    let whole = heap.capacity() - heap.header_size();
    let ptr = heap.try_allocate(whole).unwrap();
    assert_eq!(heap.used(), whole);
    unsafe { heap.free(ptr) };
    assert_layout(&heap);
}

/// Test: allocators carved from one arena never overlap.
#[test]
fn test_regions_from_one_arena_are_disjoint() {
    let config = MemoryConfig {
        arena_size: 128 * 1024,
        alignment: 32,
        free_list_size: 32 * 1024,
    };
    let arena = config.create_arena().unwrap();
    let mut first = config.create_free_list(&arena).unwrap();
    let mut second = config.create_free_list(&arena).unwrap();

    let a = first.allocate(first.capacity() - first.header_size());
    let b = second.allocate(1);
    assert_eq!(a.as_ptr() as usize % 32, 0);
    assert_eq!(b.as_ptr() as usize % 32, 0);

    let a_range = a.as_ptr() as usize..a.as_ptr() as usize + first.capacity() - first.header_size();
    assert!(!a_range.contains(&(b.as_ptr() as usize)));
    assert_layout(&first);
    assert_layout(&second);
}
