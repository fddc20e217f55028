//! # Memory Error Types
//!
//! All recoverable errors of the memory core. Allocation failure inside
//! [`FreeListAllocator::allocate`](crate::memory::FreeListAllocator::allocate)
//! is fatal and never surfaces here; use `try_allocate` to get
//! [`MemoryError::OutOfMemory`] instead.

use thiserror::Error;

/// Errors that can occur while setting up or using a memory region.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Alignment is not a power of two or is smaller than a pointer.
    #[error("invalid alignment: {0} (must be a power of two and at least pointer sized)")]
    InvalidAlignment(usize),

    /// The backing arena cannot supply the requested region.
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted {
        /// Bytes requested from the arena.
        requested: usize,
        /// Bytes the arena still had.
        available: usize,
    },

    /// Arena capacity exceeds what a single allocation can describe.
    #[error("arena capacity too large: {0} bytes")]
    CapacityOverflow(usize),

    /// Region is too small to hold a single free block.
    #[error("region too small: {size} bytes, need at least {minimum}")]
    RegionTooSmall {
        /// Size of the offered region.
        size: usize,
        /// Smallest usable region for the chosen alignment.
        minimum: usize,
    },

    /// No free block is large enough for the request.
    #[error("out of memory: no free block of {requested} bytes")]
    OutOfMemory {
        /// Aligned payload size that could not be served.
        requested: usize,
    },

    /// An internal structure invariant does not hold.
    #[error("free list corrupted: {0}")]
    Corrupted(String),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
