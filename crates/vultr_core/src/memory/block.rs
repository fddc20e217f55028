//! # Block Headers
//!
//! Every block in a free-list region, free or allocated, starts with a
//! [`BlockHeader`]. The header carries the payload size, an explicit set of
//! [`BlockFlags`] and the address-order links.
//!
//! ```text
//!   Allocated block                       Free block
//!   ┌──────────────────────┐              ┌──────────────────────┐
//!   │ size                 │              │ size                 │
//!   │ flags                │   header     │ flags                │
//!   │ prev / next          │              │ prev / next          │
//!   ├──────────────────────┤              ├──────────────────────┤
//!   │                      │              │ parent / left        │  FreeLinks
//!   │   caller payload     │   payload    │ right  / center      │
//!   │                      │              │ (unused bytes)       │
//!   └──────────────────────┘              └──────────────────────┘
//! ```
//!
//! While a block is free, the first bytes after the header hold its
//! [`FreeLinks`]: red-black tree links plus the same-size chain link. Once
//! the block is handed out, those bytes belong to the caller. This is why the
//! minimum payload is never smaller than `size_of::<FreeLinks>()`.
//!
//! Headers only ever reference each other by address. The region owns every
//! header; no header owns another.

// SAFETY: Headers live inside raw arena memory and are reached through
// `NonNull` addresses only. Every accessor documents its requirements.
#![allow(unsafe_code)]

use std::mem;
use std::ptr::NonNull;

/// Intrusive link to another block header. `None` marks a region boundary or
/// an absent tree link.
pub type Link = Option<NonNull<BlockHeader>>;

/// Node colour used by the free-block index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Color {
    /// Black node (also the colour of every nil leaf).
    #[default]
    Black,
    /// Red node.
    Red,
}

/// Bookkeeping flags stored next to the block size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockFlags {
    /// Header has been written by the allocator.
    pub initialized: bool,
    /// Payload currently belongs to a caller.
    pub allocated: bool,
    /// Tree colour, meaningful only while the block is free.
    pub color: Color,
    /// Block sits in a same-size chain instead of holding a tree position.
    pub chained: bool,
}

impl BlockFlags {
    /// Flags of a freshly initialized free block.
    #[inline]
    #[must_use]
    pub const fn free() -> Self {
        Self {
            initialized: true,
            allocated: false,
            color: Color::Black,
            chained: false,
        }
    }
}

/// Links stored in the payload of a free block.
///
/// For a block holding a tree position, `parent`, `left` and `right` are the
/// usual tree links and `center` points at the first block of its same-size
/// chain. For a chained block, `parent` points back at the previous chain
/// element (the tree node or an earlier chain member), `center` at the next
/// one, and `left`/`right` are always `None`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FreeLinks {
    /// Tree parent, or chain predecessor for chained blocks.
    pub parent: Link,
    /// Left child (smaller sizes).
    pub left: Link,
    /// Right child (larger sizes).
    pub right: Link,
    /// Next block with exactly the same size.
    pub center: Link,
}

/// Metadata prefixed to every block of a free-list region.
#[repr(C)]
#[derive(Debug)]
pub struct BlockHeader {
    /// Payload size in bytes, excluding the header.
    size: usize,
    /// Flags describing the block state.
    flags: BlockFlags,
    /// Previous block by address.
    prev: Link,
    /// Next block by address.
    next: Link,
}

/// Raw size of [`BlockHeader`]. Allocators round this up to their alignment.
pub const RAW_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Size of the links a free block keeps in its payload.
pub const FREE_LINKS_SIZE: usize = mem::size_of::<FreeLinks>();

impl BlockHeader {
    /// Writes a fresh free header at `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to writable memory large enough for a header plus
    /// [`FreeLinks`], aligned for `BlockHeader`.
    pub unsafe fn init_free(block: NonNull<Self>, size: usize, prev: Link, next: Link) {
        block.as_ptr().write(Self {
            size,
            flags: BlockFlags::free(),
            prev,
            next,
        });
        Self::links_ptr(block).write(FreeLinks::default());
    }

    /// Returns the header owning a payload address.
    ///
    /// # Safety
    ///
    /// `payload` must have been produced by [`Self::payload_of`] with the same
    /// `header_size`.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>, header_size: usize) -> NonNull<Self> {
        NonNull::new_unchecked(payload.as_ptr().sub(header_size)).cast()
    }

    /// Returns the first payload byte of `block`.
    ///
    /// # Safety
    ///
    /// `block` must be a valid header of a region using `header_size`.
    #[inline]
    pub unsafe fn payload_of(block: NonNull<Self>, header_size: usize) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(header_size))
    }

    /// Address where the free links of `block` are stored.
    #[inline]
    unsafe fn links_ptr(block: NonNull<Self>) -> *mut FreeLinks {
        block.as_ptr().cast::<u8>().add(RAW_HEADER_SIZE).cast::<FreeLinks>()
    }

    /// Payload size of `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn size(block: NonNull<Self>) -> usize {
        (*block.as_ptr()).size
    }

    /// Overwrites the payload size of `block`, leaving flags untouched.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn set_size(block: NonNull<Self>, size: usize) {
        (*block.as_ptr()).size = size;
    }

    /// Flags of `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn flags(block: NonNull<Self>) -> BlockFlags {
        (*block.as_ptr()).flags
    }

    /// Returns whether `block` is an initialized, currently free block.
    /// `None` is never free.
    ///
    /// # Safety
    ///
    /// Any `Some` block must point to an initialized header.
    #[inline]
    pub unsafe fn is_free(block: Link) -> bool {
        match block {
            Some(block) => {
                let flags = Self::flags(block);
                flags.initialized && !flags.allocated
            }
            None => false,
        }
    }

    /// Marks `block` as handed out to a caller.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn set_allocated(block: NonNull<Self>) {
        let flags = &mut (*block.as_ptr()).flags;
        flags.allocated = true;
        flags.chained = false;
    }

    /// Colour of `block`; nil leaves are black.
    ///
    /// # Safety
    ///
    /// Any `Some` block must point to an initialized header.
    #[inline]
    pub unsafe fn color(block: Link) -> Color {
        block.map_or(Color::Black, |block| (*block.as_ptr()).flags.color)
    }

    /// Returns whether `block` is red.
    ///
    /// # Safety
    ///
    /// Any `Some` block must point to an initialized header.
    #[inline]
    pub unsafe fn is_red(block: Link) -> bool {
        Self::color(block) == Color::Red
    }

    /// Returns whether `block` is black. Nil leaves are black.
    ///
    /// # Safety
    ///
    /// Any `Some` block must point to an initialized header.
    #[inline]
    pub unsafe fn is_black(block: Link) -> bool {
        !Self::is_red(block)
    }

    /// Sets the colour of `block`. Setting the colour of nil is a no-op.
    ///
    /// # Safety
    ///
    /// Any `Some` block must point to an initialized header.
    #[inline]
    pub unsafe fn set_color(block: Link, color: Color) {
        if let Some(block) = block {
            (*block.as_ptr()).flags.color = color;
        }
    }

    /// Returns whether `block` lives in a same-size chain.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn is_chained(block: NonNull<Self>) -> bool {
        (*block.as_ptr()).flags.chained
    }

    /// Sets the chain membership flag of `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn set_chained(block: NonNull<Self>, chained: bool) {
        (*block.as_ptr()).flags.chained = chained;
    }

    /// Previous block by address.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn prev(block: NonNull<Self>) -> Link {
        (*block.as_ptr()).prev
    }

    /// Next block by address.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn next(block: NonNull<Self>) -> Link {
        (*block.as_ptr()).next
    }

    /// Sets the previous address-order link.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn set_prev(block: NonNull<Self>, prev: Link) {
        (*block.as_ptr()).prev = prev;
    }

    /// Sets the next address-order link.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn set_next(block: NonNull<Self>, next: Link) {
        (*block.as_ptr()).next = next;
    }

    /// Tree parent (or chain predecessor).
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn parent(block: NonNull<Self>) -> Link {
        (*Self::links_ptr(block)).parent
    }

    /// Left child.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn left(block: NonNull<Self>) -> Link {
        (*Self::links_ptr(block)).left
    }

    /// Right child.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn right(block: NonNull<Self>) -> Link {
        (*Self::links_ptr(block)).right
    }

    /// First block of the same-size chain (or next chain member).
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn center(block: NonNull<Self>) -> Link {
        (*Self::links_ptr(block)).center
    }

    /// Sets the parent link only.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn set_parent(block: NonNull<Self>, parent: Link) {
        (*Self::links_ptr(block)).parent = parent;
    }

    /// Sets the left child and points the child back at `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn attach_left(block: NonNull<Self>, child: Link) {
        (*Self::links_ptr(block)).left = child;
        if let Some(child) = child {
            Self::set_parent(child, Some(block));
        }
    }

    /// Sets the right child and points the child back at `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn attach_right(block: NonNull<Self>, child: Link) {
        (*Self::links_ptr(block)).right = child;
        if let Some(child) = child {
            Self::set_parent(child, Some(block));
        }
    }

    /// Sets the chain link and points the chained block back at `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn attach_center(block: NonNull<Self>, member: Link) {
        (*Self::links_ptr(block)).center = member;
        if let Some(member) = member {
            Self::set_parent(member, Some(block));
        }
    }

    /// Clears all free links of `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn clear_links(block: NonNull<Self>) {
        Self::links_ptr(block).write(FreeLinks::default());
    }
}
