//! # Memory Arena
//!
//! One contiguous byte range obtained from the system allocator at startup.
//! Allocators are handed sub-regions of it through [`RegionSource`] and the
//! whole range goes back to the system only when the arena is dropped.
//!
//! ```text
//!   base                                               base + capacity
//!   ├───────────── region A ─────────────┼── region B ──┼── remaining ──┤
//!                                                       ^ offset
//! ```

// SAFETY: The arena owns a raw allocation obtained from `std::alloc`.
// Designated regions are disjoint and stay valid until the arena is dropped,
// which the borrow checker orders after every borrower.
#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::ptr::NonNull;

use crate::error::{MemoryError, MemoryResult};

/// Supplier of raw memory regions for allocators.
///
/// A region, once reserved, is never taken back while the source lives.
pub trait RegionSource {
    /// Reserves `size` bytes whose start is aligned to `alignment`.
    ///
    /// Returns `None` when the source cannot supply the region.
    fn reserve(&self, size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// Bytes still available for reservation (ignoring alignment padding).
    fn available(&self) -> usize;
}

/// A fixed-capacity backing store that hands out sub-regions.
///
/// Designation just bumps an offset. Regions are never given back
/// individually, the arena is released as a whole on drop.
///
/// # Thread Safety
///
/// This arena is NOT thread-safe. Designate regions from one thread, then
/// share allocators through [`LockedFreeList`](crate::sync::LockedFreeList).
///
/// # Example
///
/// ```rust,ignore
/// let arena = MemoryArena::new(16 * 1024 * 1024, 16)?; // 16MB
///
/// // Carve a region and run a free-list allocator on it
/// let mut heap = FreeListAllocator::init(&arena, 4 * 1024 * 1024, 16)?;
/// let ptr = heap.allocate(256);
/// ```
pub struct MemoryArena {
    /// Start of the backing allocation.
    base: NonNull<u8>,
    /// Layout used for the backing allocation.
    layout: Layout,
    /// Current designation offset from `base`.
    offset: Cell<usize>,
}

impl MemoryArena {
    /// Creates a new arena with the specified capacity in bytes.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Total size in bytes
    /// * `alignment` - Alignment of the arena start, a power of two
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidAlignment`] for a bad alignment,
    /// [`MemoryError::RegionTooSmall`] for a zero capacity and
    /// [`MemoryError::CapacityOverflow`] when the capacity cannot be laid out.
    ///
    /// # Panics
    ///
    /// Panics if the system allocator cannot provide the backing storage.
    pub fn new(capacity: usize, alignment: usize) -> MemoryResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        if capacity == 0 {
            return Err(MemoryError::RegionTooSmall {
                size: 0,
                minimum: 1,
            });
        }

        // Alignment is already known good, so only the rounded size can fail.
        let layout = Layout::from_size_align(capacity, alignment)
            .map_err(|_| MemoryError::CapacityOverflow(capacity))?;

        // SAFETY: The layout has a non-zero size.
        let base = unsafe {
            let ptr = alloc_zeroed(layout);
            match NonNull::new(ptr) {
                Some(ptr) => ptr,
                None => panic!("Allocation failed for memory arena of {capacity} bytes"),
            }
        };

        tracing::debug!(capacity, alignment, "memory arena created");

        Ok(Self {
            base,
            layout,
            offset: Cell::new(0),
        })
    }

    /// Returns the total capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns the current used space in bytes, alignment padding included.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    /// Returns the remaining free space in bytes.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Designates a sub-region of `size` bytes starting at an address aligned
    /// to `alignment`.
    ///
    /// # Returns
    ///
    /// The region start, or `None` if the arena is out of space or the
    /// alignment is not a power of two.
    pub fn designate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return None;
        }

        let base = self.base.as_ptr() as usize;
        let current = base.checked_add(self.offset.get())?;
        let start = current.checked_add(alignment - 1)? & !(alignment - 1);
        let end = start.checked_add(size)?;

        if end > base + self.capacity() {
            tracing::warn!(
                size,
                alignment,
                remaining = self.remaining(),
                "memory arena cannot designate region"
            );
            return None;
        }

        self.offset.set(end - base);

        // SAFETY: `start - base` lies inside the backing allocation.
        let region = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start - base)) };
        tracing::debug!(size, alignment, used = self.used(), "memory arena designated region");
        Some(region)
    }
}

impl RegionSource for MemoryArena {
    #[inline]
    fn reserve(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.designate(size, alignment)
    }

    #[inline]
    fn available(&self) -> usize {
        self.remaining()
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated in `new` with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish_non_exhaustive()
    }
}
