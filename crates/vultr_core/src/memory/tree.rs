//! # Free-Block Index
//!
//! A red-black tree keyed by block size, embedded inside the free blocks
//! themselves. No metadata is allocated: each free block stores its tree links
//! in its own payload (see [`FreeLinks`](super::block::FreeLinks)).
//!
//! ## Same-size chains
//!
//! The tree holds one node per distinct size. Further free blocks of an
//! already indexed size hang off that node's `center` link:
//!
//! ```text
//!                 [256]
//!                /     \
//!            [64]       [4096]
//!             │
//!             ├── 64 ── 64        <- chained blocks (no tree position)
//! ```
//!
//! A chained block keeps a back-link to its predecessor in `parent`, so
//! unlinking any chained block is O(1). Removing a tree node that owns a chain
//! promotes the first chained block into the tree position. Only blocks
//! without duplicates go through full red-black deletion.
//!
//! ## Red-black rules
//!
//! - Every node is red or black; nil leaves are black.
//! - The root is black.
//! - A red node never has a red child.
//! - Every path from a node to its nil leaves crosses the same number of
//!   black nodes.
//!
//! Chained blocks are not tree nodes and are ignored by these rules.

// SAFETY: The index links blocks that live in raw arena memory. Every
// function here requires that the blocks passed in are initialized free
// headers owned by the same region as the index.
#![allow(unsafe_code)]

use std::ptr::NonNull;

use super::block::{BlockHeader, Color, Link};

/// Outcome of the plain binary-search-tree insertion step.
enum Placement {
    /// Block took a new tree position and needs a colour fix-up.
    Node,
    /// Block joined an existing same-size chain.
    Chained,
}

/// Size-keyed red-black tree of free blocks.
#[derive(Debug, Default)]
pub struct FreeBlockIndex {
    /// Root node, `None` when no block is free.
    root: Link,
}

impl FreeBlockIndex {
    /// Creates an empty index.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None }
    }

    /// Root node of the tree.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> Link {
        self.root
    }

    /// Returns whether no free block is indexed.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    // ========================================================================
    // SEARCH
    // ========================================================================

    /// Finds the smallest free block whose size is at least `size`.
    ///
    /// Descends from the root. A node large enough for the request becomes
    /// the current candidate before the walk moves left to look for a
    /// tighter fit; a node that is too small sends the walk right. The last
    /// candidate seen is the answer once the walk falls off the tree.
    ///
    /// # Safety
    ///
    /// All indexed blocks must be valid free headers.
    #[must_use]
    pub unsafe fn best_match(&self, size: usize) -> Link {
        let mut best = None;
        let mut current = self.root;

        while let Some(node) = current {
            let node_size = BlockHeader::size(node);
            if size < node_size {
                best = Some(node);
                current = BlockHeader::left(node);
            } else if size > node_size {
                current = BlockHeader::right(node);
            } else {
                return Some(node);
            }
        }

        best
    }

    /// Leftmost (smallest) node under `node`.
    unsafe fn min(mut node: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        while let Some(left) = BlockHeader::left(node) {
            node = left;
        }
        node
    }

    /// Rightmost (largest) tree node, if any.
    ///
    /// # Safety
    ///
    /// All indexed blocks must be valid free headers.
    #[must_use]
    pub unsafe fn max(&self) -> Link {
        let mut node = self.root?;
        while let Some(right) = BlockHeader::right(node) {
            node = right;
        }
        Some(node)
    }

    /// Height of the tree counted in nodes (chains excluded).
    ///
    /// # Safety
    ///
    /// All indexed blocks must be valid free headers.
    #[must_use]
    pub unsafe fn height(&self) -> usize {
        let mut height = 0;
        let mut level: Vec<NonNull<BlockHeader>> = self.root.into_iter().collect();

        while !level.is_empty() {
            height += 1;
            level = level
                .iter()
                .flat_map(|&node| [BlockHeader::left(node), BlockHeader::right(node)])
                .flatten()
                .collect();
        }

        height
    }

    /// In-order list of `(size, blocks)` pairs, one per tree node, where
    /// `blocks` counts the node itself plus its same-size chain.
    ///
    /// # Safety
    ///
    /// All indexed blocks must be valid free headers.
    #[must_use]
    pub unsafe fn summary(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut current = self.root;

        while current.is_some() || !stack.is_empty() {
            while let Some(node) = current {
                stack.push(node);
                current = BlockHeader::left(node);
            }
            let Some(node) = stack.pop() else { break };
            out.push((BlockHeader::size(node), 1 + Self::chain_len(node)));
            current = BlockHeader::right(node);
        }

        out
    }

    /// Number of blocks chained under the tree node `node`.
    unsafe fn chain_len(node: NonNull<BlockHeader>) -> usize {
        let mut len = 0;
        let mut member = BlockHeader::center(node);
        while let Some(block) = member {
            len += 1;
            member = BlockHeader::center(block);
        }
        len
    }

    // ========================================================================
    // ROTATIONS
    // ========================================================================

    /// Replaces `old` with `new` in the child slot of `old`'s parent, or at
    /// the root. Also sets `new`'s parent.
    unsafe fn replace_in_parent(&mut self, old: NonNull<BlockHeader>, new: Link) {
        match BlockHeader::parent(old) {
            Some(parent) => {
                if BlockHeader::left(parent) == Some(old) {
                    BlockHeader::attach_left(parent, new);
                } else {
                    BlockHeader::attach_right(parent, new);
                }
            }
            None => {
                self.root = new;
                if let Some(new) = new {
                    BlockHeader::set_parent(new, None);
                }
            }
        }
    }

    /// ```text
    ///     n                r
    ///    / \              / \
    ///   a   r     =>     n   c
    ///      / \          / \
    ///     b   c        a   b
    /// ```
    unsafe fn rotate_left(&mut self, node: NonNull<BlockHeader>) {
        let Some(right) = BlockHeader::right(node) else {
            return;
        };
        BlockHeader::attach_right(node, BlockHeader::left(right));
        self.replace_in_parent(node, Some(right));
        BlockHeader::attach_left(right, Some(node));
    }

    /// Mirror image of [`Self::rotate_left`].
    unsafe fn rotate_right(&mut self, node: NonNull<BlockHeader>) {
        let Some(left) = BlockHeader::left(node) else {
            return;
        };
        BlockHeader::attach_left(node, BlockHeader::right(left));
        self.replace_in_parent(node, Some(left));
        BlockHeader::attach_right(left, Some(node));
    }

    // ========================================================================
    // INSERTION
    // ========================================================================

    /// Inserts a free block.
    ///
    /// A block whose size is already indexed is prepended to that node's
    /// same-size chain. Otherwise it becomes a red leaf and the tree is
    /// recoloured and rotated until the red-black rules hold again.
    ///
    /// # Safety
    ///
    /// `block` must be an initialized free header that is not yet indexed.
    pub unsafe fn insert(&mut self, block: NonNull<BlockHeader>) {
        debug_assert!(
            BlockHeader::is_free(Some(block)),
            "Only free memory blocks can be indexed"
        );
        BlockHeader::clear_links(block);
        BlockHeader::set_chained(block, false);

        if let Placement::Chained = self.place(block) {
            return;
        }

        self.fix_insert(block);
        BlockHeader::set_color(self.root, Color::Black);
    }

    /// Plain size-ordered insertion.
    unsafe fn place(&mut self, block: NonNull<BlockHeader>) -> Placement {
        let Some(mut node) = self.root else {
            self.root = Some(block);
            BlockHeader::set_color(Some(block), Color::Black);
            return Placement::Node;
        };

        BlockHeader::set_color(Some(block), Color::Red);
        let size = BlockHeader::size(block);

        loop {
            let node_size = BlockHeader::size(node);
            if size < node_size {
                match BlockHeader::left(node) {
                    Some(left) => node = left,
                    None => {
                        BlockHeader::attach_left(node, Some(block));
                        return Placement::Node;
                    }
                }
            } else if size > node_size {
                match BlockHeader::right(node) {
                    Some(right) => node = right,
                    None => {
                        BlockHeader::attach_right(node, Some(block));
                        return Placement::Node;
                    }
                }
            } else {
                Self::chain_push(node, block);
                return Placement::Chained;
            }
        }
    }

    /// Prepends `block` to the same-size chain of the tree node `node`.
    unsafe fn chain_push(node: NonNull<BlockHeader>, block: NonNull<BlockHeader>) {
        BlockHeader::set_chained(block, true);
        BlockHeader::attach_center(block, BlockHeader::center(node));
        BlockHeader::attach_center(node, Some(block));
    }

    /// Restores the red-black rules after `node` was placed as a red leaf.
    unsafe fn fix_insert(&mut self, mut node: NonNull<BlockHeader>) {
        while Some(node) != self.root && BlockHeader::is_red(BlockHeader::parent(node)) {
            let Some(mut parent) = BlockHeader::parent(node) else {
                break;
            };
            // A red parent is never the root, so the grandparent exists.
            let Some(grandparent) = BlockHeader::parent(parent) else {
                break;
            };

            if BlockHeader::left(grandparent) == Some(parent) {
                let uncle = BlockHeader::right(grandparent);
                if BlockHeader::is_red(uncle) {
                    BlockHeader::set_color(Some(grandparent), Color::Red);
                    BlockHeader::set_color(Some(parent), Color::Black);
                    BlockHeader::set_color(uncle, Color::Black);
                    node = grandparent;
                    continue;
                }

                if BlockHeader::right(parent) == Some(node) {
                    self.rotate_left(parent);
                    node = parent;
                    parent = match BlockHeader::parent(node) {
                        Some(parent) => parent,
                        None => break,
                    };
                }

                self.rotate_right(grandparent);
                Self::swap_colors(parent, grandparent);
                break;
            } else {
                let uncle = BlockHeader::left(grandparent);
                if BlockHeader::is_red(uncle) {
                    BlockHeader::set_color(Some(grandparent), Color::Red);
                    BlockHeader::set_color(Some(parent), Color::Black);
                    BlockHeader::set_color(uncle, Color::Black);
                    node = grandparent;
                    continue;
                }

                if BlockHeader::left(parent) == Some(node) {
                    self.rotate_right(parent);
                    node = parent;
                    parent = match BlockHeader::parent(node) {
                        Some(parent) => parent,
                        None => break,
                    };
                }

                self.rotate_left(grandparent);
                Self::swap_colors(parent, grandparent);
                break;
            }
        }
    }

    #[inline]
    unsafe fn swap_colors(a: NonNull<BlockHeader>, b: NonNull<BlockHeader>) {
        let color_a = BlockHeader::color(Some(a));
        BlockHeader::set_color(Some(a), BlockHeader::color(Some(b)));
        BlockHeader::set_color(Some(b), color_a);
    }

    // ========================================================================
    // DELETION
    // ========================================================================

    /// Removes one specific block from the index.
    ///
    /// Blocks sharing a size are distinguished by address: a chained block is
    /// unlinked from its chain, a tree node owning a chain hands its position
    /// to the first chained block, and anything else goes through red-black
    /// deletion.
    ///
    /// # Safety
    ///
    /// `block` must currently be indexed by `self`.
    pub unsafe fn remove(&mut self, block: NonNull<BlockHeader>) {
        debug_assert!(
            BlockHeader::is_free(Some(block)),
            "Memory block is not free"
        );

        if BlockHeader::is_chained(block) {
            Self::chain_unlink(block);
        } else if let Some(heir) = BlockHeader::center(block) {
            self.promote_chain_head(block, heir);
        } else {
            self.delete_node(block);
        }

        BlockHeader::clear_links(block);
        BlockHeader::set_chained(block, false);
        BlockHeader::set_color(self.root, Color::Black);
    }

    /// Unlinks a chained block from its predecessor and successor.
    unsafe fn chain_unlink(block: NonNull<BlockHeader>) {
        let pred = BlockHeader::parent(block);
        debug_assert!(pred.is_some(), "Chained memory block without a predecessor");
        if let Some(pred) = pred {
            BlockHeader::attach_center(pred, BlockHeader::center(block));
        }
    }

    /// Moves `heir`, the first block of `node`'s chain, into `node`'s tree
    /// position. The rest of the chain stays attached to `heir`.
    unsafe fn promote_chain_head(&mut self, node: NonNull<BlockHeader>, heir: NonNull<BlockHeader>) {
        BlockHeader::set_chained(heir, false);
        BlockHeader::set_color(Some(heir), BlockHeader::color(Some(node)));
        BlockHeader::attach_left(heir, BlockHeader::left(node));
        BlockHeader::attach_right(heir, BlockHeader::right(node));
        self.replace_in_parent(node, Some(heir));
    }

    /// Node that takes `node`'s place when it is unlinked: the in-order
    /// successor when there are two children, the only child, or none.
    unsafe fn replacement(node: NonNull<BlockHeader>) -> Link {
        match (BlockHeader::left(node), BlockHeader::right(node)) {
            (Some(_), Some(right)) => Some(Self::min(right)),
            (Some(left), None) => Some(left),
            (None, right) => right,
        }
    }

    /// Red-black deletion of a tree node that owns no chain.
    unsafe fn delete_node(&mut self, node: NonNull<BlockHeader>) {
        loop {
            let replacement = Self::replacement(node);
            let double_black = BlockHeader::is_black(replacement) && BlockHeader::is_black(Some(node));

            let Some(replacement) = replacement else {
                // Leaf.
                if Some(node) == self.root {
                    self.root = None;
                    return;
                }
                if double_black {
                    // The leaf stays in place as the deficient position while
                    // the tree is rebalanced around it.
                    self.fix_double_black(node);
                }
                self.replace_in_parent(node, None);
                return;
            };

            if BlockHeader::left(node).is_none() || BlockHeader::right(node).is_none() {
                // Exactly one child.
                self.replace_in_parent(node, Some(replacement));
                if double_black {
                    self.fix_double_black(replacement);
                } else {
                    BlockHeader::set_color(Some(replacement), Color::Black);
                }
                return;
            }

            // Two children: trade places with the successor and go again.
            self.swap_positions(node, replacement);
        }
    }

    /// Exchanges the tree positions (parent, children, colour) of `x` and
    /// `y`. The blocks stay at their addresses; only links move.
    unsafe fn swap_positions(&mut self, x: NonNull<BlockHeader>, y: NonNull<BlockHeader>) {
        let remap = |link: Link, from: NonNull<BlockHeader>, to: NonNull<BlockHeader>| {
            if link == Some(from) {
                Some(to)
            } else {
                link
            }
        };

        let x_parent = BlockHeader::parent(x);
        let x_left = BlockHeader::left(x);
        let x_right = BlockHeader::right(x);
        let x_color = BlockHeader::color(Some(x));
        let x_was_left = x_parent.is_some_and(|p| BlockHeader::left(p) == Some(x));

        let y_parent = BlockHeader::parent(y);
        let y_left = BlockHeader::left(y);
        let y_right = BlockHeader::right(y);
        let y_color = BlockHeader::color(Some(y));
        let y_was_left = y_parent.is_some_and(|p| BlockHeader::left(p) == Some(y));

        // x takes y's slot, y takes x's slot. Links between the two flip.
        let new_x_parent = remap(y_parent, x, y);
        let new_y_parent = remap(x_parent, y, x);

        BlockHeader::set_parent(x, new_x_parent);
        BlockHeader::attach_left(x, remap(y_left, x, y));
        BlockHeader::attach_right(x, remap(y_right, x, y));
        BlockHeader::set_color(Some(x), y_color);

        BlockHeader::set_parent(y, new_y_parent);
        BlockHeader::attach_left(y, remap(x_left, y, x));
        BlockHeader::attach_right(y, remap(x_right, y, x));
        BlockHeader::set_color(Some(y), x_color);

        // Re-point the outer parents. A parent equal to the other node was
        // already handled by the child attachments above.
        match new_x_parent {
            Some(parent) if parent != y => {
                if y_was_left {
                    BlockHeader::attach_left(parent, Some(x));
                } else {
                    BlockHeader::attach_right(parent, Some(x));
                }
            }
            Some(_) => {}
            None => self.root = Some(x),
        }

        match new_y_parent {
            Some(parent) if parent != x => {
                if x_was_left {
                    BlockHeader::attach_left(parent, Some(y));
                } else {
                    BlockHeader::attach_right(parent, Some(y));
                }
            }
            Some(_) => {}
            None => self.root = Some(y),
        }
    }

    /// Sibling of `node` in the tree.
    unsafe fn sibling(node: NonNull<BlockHeader>) -> Link {
        let parent = BlockHeader::parent(node)?;
        if BlockHeader::left(parent) == Some(node) {
            BlockHeader::right(parent)
        } else {
            BlockHeader::left(parent)
        }
    }

    #[inline]
    unsafe fn is_left_child(node: NonNull<BlockHeader>) -> bool {
        BlockHeader::parent(node).is_some_and(|parent| BlockHeader::left(parent) == Some(node))
    }

    /// Resolves a black-height deficiency at `node`.
    unsafe fn fix_double_black(&mut self, mut node: NonNull<BlockHeader>) {
        while Some(node) != self.root {
            let Some(parent) = BlockHeader::parent(node) else {
                return;
            };

            let Some(sibling) = Self::sibling(node) else {
                // Nothing to borrow from, push the deficiency up.
                node = parent;
                continue;
            };

            if BlockHeader::is_red(Some(sibling)) {
                BlockHeader::set_color(Some(parent), Color::Red);
                BlockHeader::set_color(Some(sibling), Color::Black);
                if Self::is_left_child(sibling) {
                    self.rotate_right(parent);
                } else {
                    self.rotate_left(parent);
                }
                continue;
            }

            let sibling_left = BlockHeader::left(sibling);
            let sibling_right = BlockHeader::right(sibling);

            if BlockHeader::is_red(sibling_left) || BlockHeader::is_red(sibling_right) {
                let parent_color = BlockHeader::color(Some(parent));
                let sibling_color = BlockHeader::color(Some(sibling));

                if BlockHeader::is_red(sibling_left) {
                    if Self::is_left_child(sibling) {
                        // left-left
                        BlockHeader::set_color(sibling_left, sibling_color);
                        BlockHeader::set_color(Some(sibling), parent_color);
                        self.rotate_right(parent);
                    } else {
                        // right-left
                        BlockHeader::set_color(sibling_left, parent_color);
                        self.rotate_right(sibling);
                        self.rotate_left(parent);
                    }
                } else if Self::is_left_child(sibling) {
                    // left-right
                    BlockHeader::set_color(sibling_right, parent_color);
                    self.rotate_left(sibling);
                    self.rotate_right(parent);
                } else {
                    // right-right
                    BlockHeader::set_color(sibling_right, sibling_color);
                    BlockHeader::set_color(Some(sibling), parent_color);
                    self.rotate_left(parent);
                }

                BlockHeader::set_color(Some(parent), Color::Black);
                return;
            }

            // Black sibling with two black children.
            BlockHeader::set_color(Some(sibling), Color::Red);
            if BlockHeader::is_black(Some(parent)) {
                node = parent;
            } else {
                BlockHeader::set_color(Some(parent), Color::Black);
                return;
            }
        }
    }

    // ========================================================================
    // VALIDATION
    // ========================================================================

    /// Walks the whole index and checks ordering, parent links, chain links
    /// and the red-black rules. Returns the number of indexed blocks.
    ///
    /// # Errors
    ///
    /// Returns a static description of the first violated rule.
    ///
    /// # Safety
    ///
    /// All indexed blocks must be readable headers.
    pub unsafe fn verify(&self) -> Result<usize, &'static str> {
        let Some(root) = self.root else {
            return Ok(0);
        };

        if BlockHeader::parent(root).is_some() {
            return Err("root has a parent");
        }
        if BlockHeader::is_red(Some(root)) {
            return Err("root is red");
        }

        // (node, lower bound exclusive, upper bound exclusive, blacks above)
        let mut stack = vec![(root, None::<usize>, None::<usize>, 0usize)];
        let mut leaf_black_height = None;
        let mut blocks = 0;

        while let Some((node, low, high, blacks_above)) = stack.pop() {
            let flags = BlockHeader::flags(node);
            if !flags.initialized || flags.allocated {
                return Err("indexed block is not a free block");
            }
            if flags.chained {
                return Err("tree node is flagged as chained");
            }

            let size = BlockHeader::size(node);
            if low.is_some_and(|low| size <= low) || high.is_some_and(|high| size >= high) {
                return Err("tree is not ordered by size");
            }

            let red = BlockHeader::is_red(Some(node));
            let left = BlockHeader::left(node);
            let right = BlockHeader::right(node);
            if red && (BlockHeader::is_red(left) || BlockHeader::is_red(right)) {
                return Err("red node has a red child");
            }

            blocks += 1 + Self::verify_chain(node, size)?;

            let blacks = blacks_above + usize::from(!red);
            for (child, child_low, child_high) in [(left, low, Some(size)), (right, Some(size), high)] {
                match child {
                    Some(child) => {
                        if BlockHeader::parent(child) != Some(node) {
                            return Err("child does not point back at its parent");
                        }
                        stack.push((child, child_low, child_high, blacks));
                    }
                    None => match leaf_black_height {
                        None => leaf_black_height = Some(blacks),
                        Some(expected) if expected != blacks => {
                            return Err("black height differs between paths");
                        }
                        Some(_) => {}
                    },
                }
            }
        }

        Ok(blocks)
    }

    /// Checks the chain hanging off `node`. Returns its length.
    unsafe fn verify_chain(node: NonNull<BlockHeader>, size: usize) -> Result<usize, &'static str> {
        let mut len = 0;
        let mut pred = node;
        let mut member = BlockHeader::center(node);

        while let Some(block) = member {
            let flags = BlockHeader::flags(block);
            if !flags.chained || flags.allocated || !flags.initialized {
                return Err("chain member has invalid flags");
            }
            if BlockHeader::size(block) != size {
                return Err("chain member size differs from its node");
            }
            if BlockHeader::parent(block) != Some(pred) {
                return Err("chain back-link is broken");
            }
            if BlockHeader::left(block).is_some() || BlockHeader::right(block).is_some() {
                return Err("chain member has tree children");
            }
            len += 1;
            pred = block;
            member = BlockHeader::center(block);
        }

        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Slot big enough for a header plus its free links.
    const SLOT: usize = 64;

    /// Standalone headers, not part of any region, used to drive the tree.
    struct Blocks {
        storage: Vec<[u64; SLOT / 8]>,
    }

    impl Blocks {
        fn new(count: usize) -> Self {
            Self {
                storage: vec![[0u64; SLOT / 8]; count],
            }
        }

        fn block(&mut self, index: usize, size: usize) -> NonNull<BlockHeader> {
            let block = NonNull::from(&mut self.storage[index]).cast::<BlockHeader>();
            unsafe { BlockHeader::init_free(block, size, None, None) };
            block
        }
    }

    fn sizes(index: &FreeBlockIndex) -> Vec<(usize, usize)> {
        unsafe { index.summary() }
    }

    #[test]
    fn test_empty_index() {
        let index = FreeBlockIndex::new();
        assert!(index.is_empty());
        unsafe {
            assert!(index.best_match(8).is_none());
            assert_eq!(index.verify(), Ok(0));
            assert_eq!(index.height(), 0);
        }
    }

    #[test]
    fn test_best_match_picks_smallest_fit() {
        let mut blocks = Blocks::new(3);
        let mut index = FreeBlockIndex::new();
        let small = blocks.block(0, 16);
        let medium = blocks.block(1, 64);
        let large = blocks.block(2, 256);

        unsafe {
            index.insert(large);
            index.insert(small);
            index.insert(medium);

            assert_eq!(index.best_match(40), Some(medium));
            assert_eq!(index.best_match(16), Some(small));
            assert_eq!(index.best_match(1), Some(small));
            assert_eq!(index.best_match(65), Some(large));
            assert!(index.best_match(257).is_none());
            assert_eq!(index.verify(), Ok(3));
        }
    }

    #[test]
    fn test_best_match_falls_back_to_ancestor() {
        let mut blocks = Blocks::new(3);
        let mut index = FreeBlockIndex::new();
        let fit = blocks.block(0, 96);
        let smaller = blocks.block(1, 32);
        let tail = blocks.block(2, 7840);

        unsafe {
            index.insert(fit);
            index.insert(smaller);
            index.insert(tail);
            assert_eq!(index.root(), Some(fit));

            // The left subtree only holds 32, the answer is its parent.
            assert_eq!(index.best_match(48), Some(fit));
            assert_eq!(index.best_match(97), Some(tail));
        }
    }

    #[test]
    fn test_best_match_agrees_with_linear_scan() {
        let count = 40;
        let mut blocks = Blocks::new(count);
        let mut index = FreeBlockIndex::new();
        let mut indexed = Vec::new();

        unsafe {
            for i in 0..count {
                let size = if i % 2 == 0 { (i + 2) * 16 } else { (128 - i) * 16 };
                indexed.push(size);
                let block = blocks.block(i, size);
                index.insert(block);
            }

            for request in (0..=2100).step_by(8) {
                let expected = indexed.iter().copied().filter(|&s| s >= request).min();
                let found = index.best_match(request).map(|block| BlockHeader::size(block));
                assert_eq!(found, expected, "request {request}");
            }
        }
    }

    #[test]
    fn test_interleaved_inserts_keep_red_black_rules() {
        let count = 64;
        let mut blocks = Blocks::new(count);
        let mut index = FreeBlockIndex::new();

        unsafe {
            for i in 0..count {
                let size = if i % 2 == 0 { (i + 2) * 16 } else { (128 - i) * 16 };
                let block = blocks.block(i, size);
                index.insert(block);
                assert_eq!(index.verify(), Ok(i + 1), "after inserting {size}");
            }
        }
    }

    #[test]
    fn test_ascending_inserts_stay_balanced() {
        let count = 256;
        let mut blocks = Blocks::new(count);
        let mut index = FreeBlockIndex::new();

        unsafe {
            for i in 0..count {
                let block = blocks.block(i, (i + 1) * 8);
                index.insert(block);
                assert_eq!(index.verify(), Ok(i + 1));
            }
            // 2 * log2(n + 1) bound for red-black trees.
            assert!(index.height() <= 2 * 9);
        }
    }

    #[test]
    fn test_equal_sizes_share_one_node() {
        let mut blocks = Blocks::new(4);
        let mut index = FreeBlockIndex::new();

        unsafe {
            let a = blocks.block(0, 32);
            let b = blocks.block(1, 32);
            let c = blocks.block(2, 32);
            let other = blocks.block(3, 128);
            index.insert(a);
            index.insert(other);
            index.insert(b);
            index.insert(c);

            assert_eq!(sizes(&index), vec![(32, 3), (128, 1)]);
            assert!(BlockHeader::is_chained(b));
            assert!(BlockHeader::is_chained(c));
            assert_eq!(index.verify(), Ok(4));

            // Chained block in the middle of the chain.
            index.remove(b);
            assert_eq!(sizes(&index), vec![(32, 2), (128, 1)]);
            assert_eq!(index.verify(), Ok(3));

            // Tree node owning a chain hands its slot over.
            index.remove(a);
            assert_eq!(sizes(&index), vec![(32, 1), (128, 1)]);
            assert!(!BlockHeader::is_chained(c));
            assert_eq!(index.verify(), Ok(2));

            index.remove(c);
            assert_eq!(sizes(&index), vec![(128, 1)]);
            assert_eq!(index.verify(), Ok(1));
        }
    }

    #[test]
    fn test_remove_every_node_in_mixed_order() {
        let count = 64;
        let mut blocks = Blocks::new(count);
        let mut index = FreeBlockIndex::new();
        let mut handles = Vec::new();

        unsafe {
            for i in 0..count {
                // Interleave sizes so both halves of the tree get populated.
                let size = if i % 2 == 0 { (i + 1) * 16 } else { (count * 2 - i) * 16 };
                let block = blocks.block(i, size);
                index.insert(block);
                handles.push(block);
            }
            assert_eq!(index.verify(), Ok(count));

            // Remove from the middle outwards to hit two-child deletions.
            let mut order: Vec<usize> = (0..count).collect();
            order.sort_by_key(|&i| (i as isize - (count / 2) as isize).abs());

            for (removed, &i) in order.iter().enumerate() {
                index.remove(handles[i]);
                assert_eq!(index.verify(), Ok(count - removed - 1), "after removing {i}");
            }
            assert!(index.is_empty());
        }
    }

    #[test]
    fn test_root_with_two_children_removal() {
        let mut blocks = Blocks::new(3);
        let mut index = FreeBlockIndex::new();

        unsafe {
            let a = blocks.block(0, 64);
            let b = blocks.block(1, 32);
            let c = blocks.block(2, 128);
            index.insert(a);
            index.insert(b);
            index.insert(c);
            assert_eq!(index.root(), Some(a));

            index.remove(a);
            assert_eq!(index.root(), Some(c));
            assert_eq!(index.verify(), Ok(2));
            assert_eq!(sizes(&index), vec![(32, 1), (128, 1)]);
        }
    }

    #[test]
    fn test_max_returns_largest() {
        let mut blocks = Blocks::new(3);
        let mut index = FreeBlockIndex::new();

        unsafe {
            for (i, size) in [48, 4096, 512].into_iter().enumerate() {
                let block = blocks.block(i, size);
                index.insert(block);
            }
            let largest = index.max().unwrap();
            assert_eq!(BlockHeader::size(largest), 4096);
        }
    }
}
