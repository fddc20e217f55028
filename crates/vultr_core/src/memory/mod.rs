//! # Memory Management
//!
//! One arena reserved at startup, carved into regions managed by best-fit
//! free-list allocators.
//!
//! ## Design Philosophy
//!
//! All memory is obtained once at startup. Afterwards:
//! - No system allocation calls per request
//! - Free blocks carry their own bookkeeping, no side tables
//! - Every operation is a bounded amount of pointer work
//!
//! ## Layout
//!
//! ```text
//!   MemoryArena ──designate──► region ──► FreeListAllocator
//!                                          ├── BlockHeader  (per block)
//!                                          ├── address list (prev / next)
//!                                          └── FreeBlockIndex (red-black, by size)
//! ```

mod arena;
mod block;
mod free_list;
mod tree;

pub use arena::{MemoryArena, RegionSource};
pub use block::{BlockFlags, BlockHeader, Color, FreeLinks, Link, FREE_LINKS_SIZE, RAW_HEADER_SIZE};
pub use free_list::{BlockInfo, BlockIter, FreeListAllocator, FreeListStats};
pub use tree::FreeBlockIndex;
