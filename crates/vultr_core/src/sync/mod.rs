//! # Shared Access to Allocators
//!
//! The allocators themselves take no locks: every mutating call needs
//! `&mut self`. When several threads must draw from the same region, wrap the
//! allocator in a [`LockedFreeList`], one lock per region.
//!
//! ```text
//! Thread 1 (Logic):     allocate ─┐
//! Thread 2 (Loader):    allocate ─┼──► Mutex ──► FreeListAllocator ──► region
//! Thread 3 (Audio):     free ─────┘
//! ```
//!
//! Critical sections are a handful of pointer updates, so a `parking_lot`
//! mutex is enough.

// SAFETY: `free` and `reallocate` forward the allocator's raw-pointer
// contracts unchanged.
#![allow(unsafe_code)]

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::MemoryResult;
use crate::memory::{FreeListAllocator, FreeListStats};

/// A free-list allocator behind a mutex.
pub struct LockedFreeList<'a> {
    heap: Mutex<FreeListAllocator<'a>>,
}

impl<'a> LockedFreeList<'a> {
    /// Wraps an allocator.
    #[must_use]
    pub fn new(heap: FreeListAllocator<'a>) -> Self {
        Self {
            heap: Mutex::new(heap),
        }
    }

    /// Locked [`FreeListAllocator::allocate`].
    ///
    /// # Panics
    ///
    /// Panics if no free block can hold the request.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.heap.lock().allocate(size)
    }

    /// Locked [`FreeListAllocator::try_allocate`].
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfMemory`](crate::MemoryError::OutOfMemory)
    /// when nothing fits.
    pub fn try_allocate(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        self.heap.lock().try_allocate(size)
    }

    /// Locked [`FreeListAllocator::free`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and must not have been freed yet.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.heap.lock().free(ptr);
    }

    /// Locked [`FreeListAllocator::reallocate`].
    ///
    /// # Panics
    ///
    /// Panics if the allocation has to move and no free block fits.
    ///
    /// # Safety
    ///
    /// Same as [`FreeListAllocator::reallocate`].
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> NonNull<u8> {
        self.heap.lock().reallocate(ptr, new_size)
    }

    /// Usage snapshot taken under the lock.
    #[must_use]
    pub fn stats(&self) -> FreeListStats {
        self.heap.lock().stats()
    }

    /// Runs `f` with exclusive access to the allocator.
    pub fn with<R>(&self, f: impl FnOnce(&mut FreeListAllocator<'a>) -> R) -> R {
        f(&mut self.heap.lock())
    }

    /// Unwraps the allocator.
    #[must_use]
    pub fn into_inner(self) -> FreeListAllocator<'a> {
        self.heap.into_inner()
    }
}

impl std::fmt::Debug for LockedFreeList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedFreeList")
            .field("stats", &self.stats())
            .finish()
    }
}
