//! # Free-List Churn
//!
//! Runs a deterministic random workload against one free-list region and
//! prints how the heap looks afterwards.
//!
//! Usage: `free_list_churn [config.toml] [operations] [seed]`

#![allow(unsafe_code)]

use std::process::ExitCode;
use std::ptr::NonNull;
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use vultr_core::{MemoryConfig, MemoryError};

/// Largest request issued by the workload.
const MAX_REQUEST: usize = 4096;
/// Validate the whole heap every this many operations.
const VALIDATE_EVERY: usize = 1_000;

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);

    let config = match args.next() {
        Some(path) if path != "-" => match MemoryConfig::from_toml_file(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("❌ {err}");
                return ExitCode::FAILURE;
            }
        },
        _ => MemoryConfig {
            arena_size: 16 * 1024 * 1024,
            free_list_size: 8 * 1024 * 1024,
            ..MemoryConfig::default()
        },
    };
    let operations: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(200_000);
    let seed: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(42);

    match run(&config, operations, seed) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("❌ {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &MemoryConfig, operations: usize, seed: u64) -> Result<(), MemoryError> {
    println!("╔══════════════════════════════════════════════╗");
    println!("║           FREE-LIST CHURN WORKLOAD           ║");
    println!("╚══════════════════════════════════════════════╝");
    println!("arena:      {} bytes", config.arena_size);
    println!("free list:  {} bytes", config.free_list_size);
    println!("alignment:  {}", config.alignment);
    println!("operations: {operations} (seed {seed})");

    let arena = config.create_arena()?;
    let mut heap = config.create_free_list(&arena)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut live: Vec<NonNull<u8>> = Vec::new();

    let mut allocations = 0usize;
    let mut frees = 0usize;
    let mut reallocations = 0usize;
    let mut failures = 0usize;
    let mut peak_used = 0usize;

    let start = Instant::now();

    for op in 0..operations {
        let roll = rng.gen_range(0..100);

        if roll < 55 || live.is_empty() {
            match heap.try_allocate(rng.gen_range(1..=MAX_REQUEST)) {
                Ok(ptr) => {
                    live.push(ptr);
                    allocations += 1;
                }
                Err(MemoryError::OutOfMemory { .. }) => failures += 1,
                Err(err) => return Err(err),
            }
        } else if roll < 90 {
            let ptr = live.swap_remove(rng.gen_range(0..live.len()));
            // SAFETY: Every pointer in `live` came from `heap` and is freed once.
            unsafe { heap.free(ptr) };
            frees += 1;
        } else {
            let index = rng.gen_range(0..live.len());
            // SAFETY: As above; the slot is overwritten with the new address.
            match unsafe { heap.try_reallocate(live[index], rng.gen_range(1..=2 * MAX_REQUEST)) } {
                Ok(ptr) => {
                    live[index] = ptr;
                    reallocations += 1;
                }
                Err(MemoryError::OutOfMemory { .. }) => failures += 1,
                Err(err) => return Err(err),
            }
        }

        peak_used = peak_used.max(heap.used());
        if (op + 1) % VALIDATE_EVERY == 0 {
            heap.validate()?;
        }
    }

    let elapsed = start.elapsed();
    let stats = heap.stats();
    heap.validate()?;

    println!();
    println!("elapsed:        {elapsed:?}");
    println!("allocations:    {allocations}");
    println!("frees:          {frees}");
    println!("reallocations:  {reallocations}");
    println!("out of memory:  {failures}");
    println!("peak used:      {peak_used} bytes");
    println!();
    println!("live blocks:    {}", live.len());
    println!("used:           {} bytes", stats.used);
    println!("free:           {} bytes in {} blocks", stats.free_bytes, stats.free_blocks);
    println!("largest free:   {} bytes", stats.largest_free_block);
    println!("fragmentation:  {:.2}%", stats.fragmentation() * 100.0);
    println!("index height:   {}", stats.index_height);
    println!("distinct sizes: {}", heap.index_summary().len());

    for ptr in live.drain(..) {
        // SAFETY: Same as above.
        unsafe { heap.free(ptr) };
    }
    heap.validate()?;
    println!();
    println!("✅ heap collapsed back to {} block(s)", heap.blocks().count());

    Ok(())
}
