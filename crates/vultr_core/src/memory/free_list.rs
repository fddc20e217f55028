//! # Free-List Allocator
//!
//! General purpose allocator over a single designated region. Every block,
//! free or allocated, is prefixed by a [`BlockHeader`] and linked to its
//! address-order neighbours. Free blocks are additionally indexed by size in
//! a [`FreeBlockIndex`] for best-fit lookups.
//!
//! ## Allocation
//!
//! ```text
//!   best fit (free)                          after split
//!   ┌────┬──────────────────────────┐        ┌────┬────────┬────┬───────────┐
//!   │ H  │          free            │   =>   │ H  │ in use │ H  │   free    │
//!   └────┴──────────────────────────┘        └────┴────────┴────┴───────────┘
//!                                                              ^ reinserted
//! ```
//!
//! The remainder is only carved off when it can hold a header plus the
//! minimum payload. Otherwise the caller gets a slightly larger block.
//!
//! ## Freeing
//!
//! ```text
//!   ┌────┬──────┬────┬────────┬────┬──────┐        ┌────┬──────────────────────────┐
//!   │ H  │ free │ H  │ freed  │ H  │ free │   =>   │ H  │           free           │
//!   └────┴──────┴────┴────────┴────┴──────┘        └────┴──────────────────────────┘
//! ```
//!
//! A freed block absorbs any free neighbour so no two adjacent blocks are
//! ever free at the same time.
//!
//! ## Performance
//!
//! - Best fit, insert and remove: O(log n) in the number of distinct free sizes
//! - Split and coalesce: O(1) plus index updates
//! - No system calls after initialization

// SAFETY: The allocator owns its region exclusively and manipulates headers
// through raw addresses. Public unsafe entry points document what callers
// must uphold.
#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use super::arena::RegionSource;
use super::block::{BlockHeader, Link, FREE_LINKS_SIZE, RAW_HEADER_SIZE};
use super::tree::FreeBlockIndex;
use crate::error::{MemoryError, MemoryResult};

/// Rounds `value` up to a multiple of `alignment` (a power of two).
#[inline]
const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// One block as seen when walking the region in address order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Byte offset of the header from the first block of the region.
    pub offset: usize,
    /// Payload size in bytes.
    pub size: usize,
    /// Whether the payload is handed out.
    pub allocated: bool,
}

/// Snapshot of allocator usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeListStats {
    /// Usable region size (headers included).
    pub capacity: usize,
    /// Payload bytes currently handed out.
    pub used: usize,
    /// Payload bytes in free blocks.
    pub free_bytes: usize,
    /// Total number of blocks.
    pub blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Payload size of the largest free block.
    pub largest_free_block: usize,
    /// Height of the free-block index.
    pub index_height: usize,
}

impl FreeListStats {
    /// Share of free payload bytes outside the largest free block, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fragmentation(&self) -> f64 {
        if self.free_bytes == 0 {
            return 0.0;
        }
        1.0 - self.largest_free_block as f64 / self.free_bytes as f64
    }
}

/// Best-fit free-list allocator over one region.
///
/// # Thread Safety
///
/// Every mutating call takes `&mut self`. Share an allocator between threads
/// through [`LockedFreeList`](crate::sync::LockedFreeList).
///
/// # Example
///
/// ```rust,ignore
/// let arena = MemoryArena::new(1024 * 1024, 16)?;
/// let mut heap = FreeListAllocator::init(&arena, 64 * 1024, 16)?;
///
/// let ptr = heap.allocate(100);
/// let ptr = unsafe { heap.reallocate(ptr, 400) };
/// unsafe { heap.free(ptr) };
/// ```
pub struct FreeListAllocator<'a> {
    /// First block header of the region.
    first: NonNull<BlockHeader>,
    /// Size index over the free blocks.
    index: FreeBlockIndex,
    /// Usable bytes starting at `first`, headers included.
    capacity: usize,
    /// Payload and header alignment.
    alignment: usize,
    /// Header span, the raw header rounded up to `alignment`.
    header_size: usize,
    /// Payload bytes currently handed out.
    used: usize,
    /// Ties the allocator to the source its region came from.
    _region: PhantomData<&'a ()>,
}

// SAFETY: The allocator is the only owner of its region. Nothing in it is
// tied to the thread that created it.
unsafe impl Send for FreeListAllocator<'_> {}

impl<'a> FreeListAllocator<'a> {
    // ========================================================================
    // SETUP
    // ========================================================================

    /// Designates `size` bytes from `source` and manages them as one free
    /// block.
    ///
    /// # Arguments
    ///
    /// * `source` - Where the region comes from, usually a [`MemoryArena`](super::MemoryArena)
    /// * `size` - Region size in bytes, headers included
    /// * `alignment` - Payload alignment, a power of two at least pointer sized
    ///
    /// # Errors
    ///
    /// - [`MemoryError::InvalidAlignment`] for a bad alignment
    /// - [`MemoryError::RegionTooSmall`] when `size` cannot hold one block
    /// - [`MemoryError::ArenaExhausted`] when `source` cannot supply `size` bytes
    pub fn init<S: RegionSource + ?Sized>(
        source: &'a S,
        size: usize,
        alignment: usize,
    ) -> MemoryResult<Self> {
        Self::check_alignment(alignment)?;

        let minimum = Self::minimum_region(alignment);
        if size < minimum {
            return Err(MemoryError::RegionTooSmall { size, minimum });
        }

        let region = source.reserve(size, alignment).ok_or(MemoryError::ArenaExhausted {
            requested: size,
            available: source.available(),
        })?;

        // SAFETY: The source hands out `size` writable bytes that live as
        // long as `'a` and are never reserved twice.
        unsafe { Self::from_region(region, size, alignment) }
    }

    /// Manages an arbitrary memory range.
    ///
    /// The start is aligned up to `alignment` and the tail that does not fill
    /// a whole alignment unit is left unused.
    ///
    /// # Errors
    ///
    /// Same as [`Self::init`], minus arena exhaustion.
    ///
    /// # Safety
    ///
    /// `region` must point to `size` writable bytes that stay valid and
    /// untouched by anything else for the whole lifetime `'a`.
    pub unsafe fn from_region(
        region: NonNull<u8>,
        size: usize,
        alignment: usize,
    ) -> MemoryResult<Self> {
        Self::check_alignment(alignment)?;

        let header_size = align_up(RAW_HEADER_SIZE, alignment);
        let minimum = Self::minimum_region(alignment);

        let address = region.as_ptr() as usize;
        let padding = align_up(address, alignment) - address;
        let usable = size.saturating_sub(padding);
        if usable < minimum {
            return Err(MemoryError::RegionTooSmall { size, minimum });
        }

        let payload = (usable - header_size) & !(alignment - 1);
        let first: NonNull<BlockHeader> = NonNull::new_unchecked(region.as_ptr().add(padding)).cast();
        BlockHeader::init_free(first, payload, None, None);

        let mut index = FreeBlockIndex::new();
        index.insert(first);

        tracing::debug!(
            capacity = header_size + payload,
            alignment,
            header_size,
            "free list initialized"
        );

        Ok(Self {
            first,
            index,
            capacity: header_size + payload,
            alignment,
            header_size,
            used: 0,
            _region: PhantomData,
        })
    }

    fn check_alignment(alignment: usize) -> MemoryResult<()> {
        if alignment.is_power_of_two() && alignment >= mem::align_of::<BlockHeader>() {
            Ok(())
        } else {
            Err(MemoryError::InvalidAlignment(alignment))
        }
    }

    /// Smallest region that fits one header plus the minimum payload.
    const fn minimum_region(alignment: usize) -> usize {
        align_up(RAW_HEADER_SIZE, alignment) + align_up(FREE_LINKS_SIZE, alignment)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Payload bytes currently handed out.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Usable region size in bytes, headers included.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Alignment of every payload.
    #[inline]
    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.alignment
    }

    /// Bytes occupied by each block header.
    #[inline]
    #[must_use]
    pub const fn header_size(&self) -> usize {
        self.header_size
    }

    /// Payload size actually reserved for a request of `size` bytes.
    ///
    /// Rounds up to the alignment, never below the room a free block needs
    /// for its index links.
    #[inline]
    #[must_use]
    pub const fn aligned_size(&self, size: usize) -> usize {
        let size = if size < FREE_LINKS_SIZE { FREE_LINKS_SIZE } else { size };
        size.saturating_add(self.alignment - 1) & !(self.alignment - 1)
    }

    /// Smallest payload a block can have.
    #[inline]
    #[must_use]
    pub const fn min_payload(&self) -> usize {
        self.aligned_size(0)
    }

    // ========================================================================
    // ALLOCATION
    // ========================================================================

    /// Allocates `size` bytes, returning the payload address.
    ///
    /// # Panics
    ///
    /// Panics if no free block can hold the request. Use
    /// [`Self::try_allocate`] to handle exhaustion.
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        match self.try_allocate(size) {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::error!(
                    size,
                    used = self.used,
                    capacity = self.capacity,
                    "free list allocation failed"
                );
                panic!("Allocation failed for free list: {err}");
            }
        }
    }

    /// Allocates `size` bytes, returning the payload address.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfMemory`] when no free block is large
    /// enough. The allocator is left untouched in that case.
    pub fn try_allocate(&mut self, size: usize) -> MemoryResult<NonNull<u8>> {
        let required = self.aligned_size(size);

        // SAFETY: Every indexed block is a free header of this region.
        unsafe {
            let Some(block) = self.index.best_match(required) else {
                return Err(MemoryError::OutOfMemory { requested: required });
            };

            self.index.remove(block);
            if let Some(rest) = self.split(block, required) {
                self.index.insert(rest);
            }

            BlockHeader::set_allocated(block);
            let granted = BlockHeader::size(block);
            self.used += granted;

            tracing::trace!(size, granted, used = self.used, "free list allocate");
            Ok(BlockHeader::payload_of(block, self.header_size))
        }
    }

    /// Allocates a zero-filled array of `count` values.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::InvalidAlignment`] when `T` needs more alignment than
    ///   the allocator provides
    /// - [`MemoryError::OutOfMemory`] when the array does not fit
    pub fn allocate_zeroed<T: bytemuck::Zeroable>(&mut self, count: usize) -> MemoryResult<NonNull<[T]>> {
        if mem::align_of::<T>() > self.alignment {
            return Err(MemoryError::InvalidAlignment(mem::align_of::<T>()));
        }
        let bytes = mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(MemoryError::OutOfMemory { requested: usize::MAX })?;

        let ptr = self.try_allocate(bytes)?;
        // SAFETY: The payload holds at least `bytes` bytes and all-zero is a
        // valid `T`.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, bytes) };

        Ok(NonNull::slice_from_raw_parts(ptr.cast::<T>(), count))
    }

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and must not have been freed yet.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = BlockHeader::from_payload(ptr, self.header_size);
        let flags = BlockHeader::flags(block);
        debug_assert!(
            flags.initialized && flags.allocated,
            "Freeing a memory block that is not allocated"
        );

        let size = BlockHeader::size(block);
        BlockHeader::init_free(block, size, BlockHeader::prev(block), BlockHeader::next(block));
        self.used -= size;

        let merged = self.coalesce(block);
        tracing::trace!(size, merged = BlockHeader::size(merged), used = self.used, "free list free");
    }

    /// Resizes an allocation, preserving `min(old, new)` payload bytes.
    ///
    /// # Panics
    ///
    /// Panics if the allocation has to move and no free block fits.
    ///
    /// # Safety
    ///
    /// Same as [`Self::free`]. On return the old pointer must no longer be
    /// used unless it equals the returned one.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> NonNull<u8> {
        match self.try_reallocate(ptr, new_size) {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::error!(new_size, used = self.used, "free list reallocation failed");
                panic!("Reallocation failed for free list: {err}");
            }
        }
    }

    /// Resizes an allocation, preserving `min(old, new)` payload bytes.
    ///
    /// Shrinking keeps the block as is. Growing first tries to absorb a free
    /// block that directly follows, then falls back to allocate, copy, free.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfMemory`] when the allocation has to move
    /// and nothing fits. The original allocation stays valid.
    ///
    /// # Safety
    ///
    /// Same as [`Self::reallocate`].
    pub unsafe fn try_reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> MemoryResult<NonNull<u8>> {
        let block = BlockHeader::from_payload(ptr, self.header_size);
        debug_assert!(
            BlockHeader::flags(block).allocated,
            "Reallocating a memory block that is not allocated"
        );

        let current = BlockHeader::size(block);
        let required = self.aligned_size(new_size);
        if required <= current {
            return Ok(ptr);
        }

        if let Some(next) = BlockHeader::next(block).filter(|&next| BlockHeader::is_free(Some(next))) {
            if current + self.header_size + BlockHeader::size(next) >= required {
                self.index.remove(next);
                self.merge(block, next);
                // The block after `next` is never free, no further merge.
                if let Some(rest) = self.split(block, required) {
                    self.index.insert(rest);
                }
                self.used = self.used - current + BlockHeader::size(block);

                tracing::trace!(current, granted = BlockHeader::size(block), "free list grew in place");
                return Ok(ptr);
            }
        }

        let moved = self.try_allocate(new_size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), current.min(new_size));
        self.free(ptr);

        Ok(moved)
    }

    // ========================================================================
    // SPLIT & COALESCE
    // ========================================================================

    /// Truncates `block` to `required` payload bytes and carves a free block
    /// out of the rest. Returns the remainder for insertion into the index,
    /// or `None` when the rest is too small to be a block.
    unsafe fn split(&mut self, block: NonNull<BlockHeader>, required: usize) -> Link {
        let size = BlockHeader::size(block);
        if size < required + self.header_size + self.min_payload() {
            return None;
        }

        let next = BlockHeader::next(block);
        let rest = NonNull::new_unchecked(
            BlockHeader::payload_of(block, self.header_size).as_ptr().add(required),
        )
        .cast::<BlockHeader>();

        BlockHeader::init_free(rest, size - required - self.header_size, Some(block), next);
        if let Some(next) = next {
            BlockHeader::set_prev(next, Some(rest));
        }
        BlockHeader::set_next(block, Some(rest));
        BlockHeader::set_size(block, required);

        Some(rest)
    }

    /// Folds `right`, the address-order successor of `left`, into `left`.
    unsafe fn merge(&mut self, left: NonNull<BlockHeader>, right: NonNull<BlockHeader>) {
        let size = BlockHeader::size(left) + self.header_size + BlockHeader::size(right);
        let next = BlockHeader::next(right);

        BlockHeader::set_size(left, size);
        BlockHeader::set_next(left, next);
        if let Some(next) = next {
            BlockHeader::set_prev(next, Some(left));
        }
    }

    /// Merges the free, unindexed `block` with its free neighbours and
    /// indexes the result. Returns the surviving header.
    unsafe fn coalesce(&mut self, block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let mut merged = block;

        if let Some(next) = BlockHeader::next(block).filter(|&next| BlockHeader::is_free(Some(next))) {
            self.index.remove(next);
            self.merge(block, next);
        }

        if let Some(prev) = BlockHeader::prev(block).filter(|&prev| BlockHeader::is_free(Some(prev))) {
            self.index.remove(prev);
            self.merge(prev, block);
            merged = prev;
        }

        self.index.insert(merged);
        merged
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    /// Walks every block in address order.
    #[must_use]
    pub fn blocks(&self) -> BlockIter<'_> {
        BlockIter {
            next: Some(self.first),
            first: self.first.as_ptr() as usize,
            _heap: PhantomData,
        }
    }

    /// `(size, blocks)` for every distinct free size, smallest first.
    #[must_use]
    pub fn index_summary(&self) -> Vec<(usize, usize)> {
        // SAFETY: Every indexed block is a free header of this region.
        unsafe { self.index.summary() }
    }

    /// Payload bytes held by free blocks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.blocks()
            .filter(|block| !block.allocated)
            .map(|block| block.size)
            .sum()
    }

    /// Payload size of the largest free block, if any block is free.
    #[must_use]
    pub fn largest_free_block(&self) -> Option<usize> {
        // SAFETY: Every indexed block is a free header of this region.
        unsafe { self.index.max().map(|block| BlockHeader::size(block)) }
    }

    /// Snapshot of the current usage.
    #[must_use]
    pub fn stats(&self) -> FreeListStats {
        let mut stats = FreeListStats {
            capacity: self.capacity,
            used: self.used,
            largest_free_block: self.largest_free_block().unwrap_or(0),
            // SAFETY: Every indexed block is a free header of this region.
            index_height: unsafe { self.index.height() },
            ..FreeListStats::default()
        };

        for block in self.blocks() {
            stats.blocks += 1;
            if !block.allocated {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
            }
        }

        stats
    }

    /// Checks every structural invariant of the region and the index.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Corrupted`] describing the first violation.
    pub fn validate(&self) -> MemoryResult<()> {
        let corrupted = |reason: String| Err(MemoryError::Corrupted(reason));

        let start = self.first.as_ptr() as usize;
        let mut expected_prev: Link = None;
        let mut current = Some(self.first);
        let mut spanned = 0;
        let mut used = 0;
        let mut free_blocks = 0;
        let mut prev_free = false;

        // SAFETY: The walk follows `next` links that, if intact, only reach
        // headers inside the region. Each step is bounds-checked first.
        unsafe {
            while let Some(block) = current {
                let offset = (block.as_ptr() as usize).wrapping_sub(start);
                if offset != spanned {
                    return corrupted(format!("block at offset {offset} expected at {spanned}"));
                }
                if spanned + self.header_size > self.capacity {
                    return corrupted(format!("block at offset {offset} overruns the region"));
                }

                let flags = BlockHeader::flags(block);
                if !flags.initialized {
                    return corrupted(format!("block at offset {offset} is not initialized"));
                }
                if BlockHeader::prev(block) != expected_prev {
                    return corrupted(format!("block at offset {offset} has a broken prev link"));
                }

                let size = BlockHeader::size(block);
                if size % self.alignment != 0 || size < self.min_payload() {
                    return corrupted(format!("block at offset {offset} has invalid size {size}"));
                }

                if flags.allocated {
                    used += size;
                    prev_free = false;
                } else {
                    if prev_free {
                        return corrupted(format!("adjacent free blocks at offset {offset}"));
                    }
                    free_blocks += 1;
                    prev_free = true;
                }

                spanned += self.header_size + size;
                expected_prev = Some(block);
                current = BlockHeader::next(block);
            }

            if spanned != self.capacity {
                return corrupted(format!("blocks span {spanned} bytes of {}", self.capacity));
            }
            if used != self.used {
                return corrupted(format!("used is {} but allocated blocks hold {used}", self.used));
            }

            match self.index.verify() {
                Ok(indexed) if indexed == free_blocks => Ok(()),
                Ok(indexed) => corrupted(format!("{indexed} blocks indexed, {free_blocks} free")),
                Err(reason) => corrupted(reason.to_owned()),
            }
        }
    }
}

impl std::fmt::Debug for FreeListAllocator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListAllocator")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("alignment", &self.alignment)
            .field("header_size", &self.header_size)
            .finish_non_exhaustive()
    }
}

/// Address-order iterator over the blocks of a [`FreeListAllocator`].
pub struct BlockIter<'h> {
    /// Next header to visit.
    next: Link,
    /// Address of the first header.
    first: usize,
    /// Borrow of the allocator the headers belong to.
    _heap: PhantomData<&'h ()>,
}

impl Iterator for BlockIter<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.next?;

        // SAFETY: The allocator is borrowed for the iterator's lifetime, so
        // the address list cannot change underneath it.
        unsafe {
            let flags = BlockHeader::flags(block);
            self.next = BlockHeader::next(block);

            Some(BlockInfo {
                offset: block.as_ptr() as usize - self.first,
                size: BlockHeader::size(block),
                allocated: flags.allocated,
            })
        }
    }
}
