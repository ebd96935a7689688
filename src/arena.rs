//! Block arena owning the decoded data of one result set.
//!
//! Allocations are addressed through [`ArenaSlice`] handles instead of references, so column
//! definitions and row fields can be stored next to the arena that owns their bytes. Nothing is
//! freed individually; [`Arena::reset`] or dropping the arena releases every block at once.

use tracing::trace;

/// Block sizes are rounded up to this multiple.
pub const BLOCK_ALIGN: usize = 64;

/// Default preallocation for a fresh arena.
pub const DEFAULT_PREALLOC: usize = 0x2000;

fn align(size: usize) -> usize {
    size.div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN
}

#[derive(Debug)]
struct Block {
    data: Box<[u8]>,
    used: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; align(size)].into_boxed_slice(),
            used: 0,
        }
    }

    fn free(&self) -> usize {
        self.data.len() - self.used
    }
}

/// Handle to bytes owned by an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaSlice {
    block: usize,
    offset: usize,
    len: usize,
}

impl ArenaSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
pub struct Arena {
    blocks: Vec<Block>,
    prealloc: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(DEFAULT_PREALLOC)
    }
}

impl Arena {
    /// Creates an arena with one block of `prealloc` bytes (aligned).
    pub fn new(prealloc: usize) -> Self {
        let prealloc = align(prealloc.max(1));
        Self {
            blocks: vec![Block::new(prealloc)],
            prealloc,
        }
    }

    /// Reserves `size` zeroed bytes in the block with the smallest sufficient leftover space,
    /// appending a new block of `max(size, prealloc)` bytes when none fits.
    pub fn alloc(&mut self, size: usize) -> ArenaSlice {
        let best = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.free() >= size)
            .min_by_key(|(_, block)| block.free() - size)
            .map(|(index, _)| index);

        let index = match best {
            Some(index) => index,
            None => {
                let block = Block::new(size.max(self.prealloc));
                trace!(size = block.data.len(), blocks = self.blocks.len() + 1, "arena block added");
                self.blocks.push(block);
                self.blocks.len() - 1
            }
        };

        let block = &mut self.blocks[index];
        let slice = ArenaSlice {
            block: index,
            offset: block.used,
            len: size,
        };
        block.used += size;
        slice
    }

    /// Allocates and copies `bytes` into the arena.
    pub fn alloc_copy(&mut self, bytes: &[u8]) -> ArenaSlice {
        let slice = self.alloc(bytes.len());
        self.get_mut(slice).copy_from_slice(bytes);
        slice
    }

    pub fn get(&self, slice: ArenaSlice) -> &[u8] {
        &self.blocks[slice.block].data[slice.offset..slice.offset + slice.len]
    }

    pub fn get_mut(&mut self, slice: ArenaSlice) -> &mut [u8] {
        &mut self.blocks[slice.block].data[slice.offset..slice.offset + slice.len]
    }

    /// Releases every block and starts over with a single preallocated block. Handles issued
    /// before the reset must not be used afterwards.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.blocks.push(Block::new(self.prealloc));
    }

    /// Total bytes owned by the arena.
    pub fn allocated_bytes(&self) -> usize {
        self.blocks.iter().map(|block| block.data.len()).sum()
    }

    /// Bytes handed out by [`Arena::alloc`].
    pub fn used_bytes(&self) -> usize {
        self.blocks.iter().map(|block| block.used).sum()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_reachable() {
        let mut arena = Arena::new(128);
        let sizes = [10usize, 100, 3, 500, 64, 1, 0, 127];
        let slices: Vec<_> = sizes.iter().map(|&size| arena.alloc(size)).collect();

        let total: usize = sizes.iter().sum();
        assert_eq!(arena.used_bytes(), total);
        assert!(arena.allocated_bytes() >= total);
        for (slice, size) in slices.iter().zip(sizes) {
            assert_eq!(arena.get(*slice).len(), size);
        }
    }

    #[test]
    fn test_best_fit_prefers_smallest_leftover() {
        let mut arena = Arena::new(64);
        arena.alloc(200);
        assert_eq!(arena.block_count(), 2);
        // block 0: 64 free, block 1: 56 free
        assert_eq!(arena.alloc(40).block, 1);
        // block 0: 64 free, block 1: 16 free
        assert_eq!(arena.alloc(20).block, 0);
        // block 0: 44 free, block 1: 16 free
        assert_eq!(arena.alloc(10).block, 1);
        assert_eq!(arena.block_count(), 2);
    }

    #[test]
    fn test_new_block_uses_prealloc_or_request() {
        let mut arena = Arena::new(100);
        assert_eq!(arena.allocated_bytes(), 128);
        arena.alloc(1000);
        assert_eq!(arena.allocated_bytes(), 128 + 1024);
        arena.alloc(120);
        assert_eq!(arena.block_count(), 2);
        arena.alloc(30);
        assert_eq!(arena.block_count(), 3);
        assert_eq!(arena.allocated_bytes(), 128 + 1024 + 128);
    }

    #[test]
    fn test_alloc_copy_keeps_bytes_apart() {
        let mut arena = Arena::default();
        let a = arena.alloc_copy(b"catalog");
        let b = arena.alloc_copy(b"");
        let c = arena.alloc_copy(b"name");
        assert_eq!(arena.get(a), b"catalog");
        assert!(arena.get(b).is_empty());
        assert_eq!(arena.get(c), b"name");
    }

    #[test]
    fn test_reset_releases_blocks() {
        let mut arena = Arena::new(64);
        for _ in 0..10 {
            arena.alloc(100);
        }
        assert!(arena.block_count() > 1);
        arena.reset();
        assert_eq!(arena.block_count(), 1);
        assert_eq!(arena.used_bytes(), 0);
        assert_eq!(arena.allocated_bytes(), 64);
    }

    #[test]
    fn test_handles_span_multi_frame_sizes() {
        let big = 0x100_0000 + 5;
        let mut arena = Arena::new(2 * big);
        let first = arena.alloc(big);
        let second = arena.alloc_copy(b"tail");
        assert_eq!(arena.block_count(), 1);
        assert_eq!(first.len(), big);
        assert_eq!(second.offset, big);
        assert_eq!(arena.get(second), b"tail");
    }
}
