//! # VULTR Memory Core
//!
//! Custom allocation for the real-time engine:
//! - One arena reserved at startup, never grown
//! - Best-fit free-list allocation with no per-request system calls
//! - Free blocks indexed in place by a size-keyed red-black tree
//!
//! ## Architecture Rules
//!
//! 1. **No system allocation in the hot path** - regions are carved once
//! 2. **Intrusive bookkeeping** - headers and tree links live inside the blocks
//! 3. **Bounded work per call** - allocate, free and reallocate never scan the heap
//!
//! ## Example
//!
//! ```rust,ignore
//! use vultr_core::{FreeListAllocator, MemoryArena};
//!
//! let arena = MemoryArena::new(64 * 1024 * 1024, 16)?;
//! let mut heap = FreeListAllocator::init(&arena, 32 * 1024 * 1024, 16)?;
//!
//! let ptr = heap.allocate(256);
//! unsafe { heap.free(ptr) };
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::MemoryConfig;
pub use error::{MemoryError, MemoryResult};
pub use memory::{
    BlockInfo, FreeBlockIndex, FreeListAllocator, FreeListStats, MemoryArena, RegionSource,
};
pub use sync::LockedFreeList;
