use super::chunk::{Chunk, PoolError};
use std::ptr::NonNull;

/// Upper bound on blocks per chunk, imposed by the one-byte free-list link
/// inside [`Chunk`].
pub(crate) const MAX_BLOCKS_PER_CHUNK: usize = u8::MAX as usize;

/// A pool serving one specific block size, built from a growable sequence of
/// fixed-capacity [`Chunk`]s.
///
/// Allocation prefers the chunk that served the previous request, falling
/// back to a front-to-back scan and finally to growing by one chunk.
/// Deallocation locates the owning chunk with a vicinity search that steps
/// outward from the chunk touched by the previous deallocation, then applies
/// the empty-chunk retention policy: at most one fully-empty chunk survives,
/// parked at the tail as a spare against alloc/free oscillation.
///
/// All hints are indices into `chunks`, so growth, shrink, and moves of the
/// allocator itself never invalidate them. `FixedAllocator` is move-only;
/// dropping it releases every chunk, and debug builds assert that no block
/// is still live at that point.
pub struct FixedAllocator {
    block_size: usize,
    /// Blocks per chunk: `clamp(chunk_size / block_size, 1, 255)`.
    num_blocks: u8,
    chunks: Vec<Chunk>,
    /// Chunk that most recently served an allocation.
    alloc_hint: Option<usize>,
    /// Chunk most recently touched or discovered by a deallocation.
    dealloc_hint: Option<usize>,
}

impl FixedAllocator {
    /// Create a pool for `block_size`-byte blocks, sizing each chunk to
    /// approximately `chunk_size` bytes.
    #[must_use]
    pub fn new(block_size: usize, chunk_size: usize) -> Self {
        debug_assert!(block_size > 0);
        let num_blocks = (chunk_size / block_size).clamp(1, MAX_BLOCKS_PER_CHUNK) as u8;
        Self {
            block_size,
            num_blocks,
            chunks: Vec::new(),
            alloc_hint: None,
            dealloc_hint: None,
        }
    }

    /// The block size this pool was created with.
    #[inline]
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub(crate) fn num_blocks(&self) -> u8 {
        self.num_blocks
    }

    /// Number of chunks currently backing this pool.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total free blocks across all chunks.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.chunks.iter().map(|c| c.available() as usize).sum()
    }

    #[cfg(test)]
    pub(crate) fn dealloc_hint(&self) -> Option<usize> {
        self.dealloc_hint
    }

    /// Hand out one uninitialised block of `block_size` bytes.
    ///
    /// Amortised O(1): the hinted chunk serves repeats, a front-to-back scan
    /// picks up partially-filled chunks, and only when every chunk is full
    /// does the pool grow by one chunk.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::OutOfMemory` if the system allocator fails while
    /// growing. The failed chunk is never linked in; the pool is unchanged.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, PoolError> {
        if let Some(i) = self.alloc_hint {
            if self.chunks[i].available() > 0 {
                return Ok(self.pop_block(i));
            }
        }

        if let Some(i) = self.chunks.iter().position(|c| c.available() > 0) {
            self.alloc_hint = Some(i);
            return Ok(self.pop_block(i));
        }

        // Every chunk is full: grow by one.
        let chunk = Chunk::init(self.block_size, self.num_blocks)?;
        self.chunks.push(chunk);
        let tail = self.chunks.len() - 1;
        self.alloc_hint = Some(tail);
        if self.dealloc_hint.is_none() {
            self.dealloc_hint = Some(0);
        }
        Ok(self.pop_block(tail))
    }

    fn pop_block(&mut self, index: usize) -> NonNull<u8> {
        self.chunks[index]
            .allocate(self.block_size)
            .expect("chunk with free blocks must yield a block")
    }

    /// Return a block to the pool.
    ///
    /// # Safety
    ///
    /// `p` must have been returned by [`allocate`](Self::allocate) on this
    /// same allocator, must not have been deallocated since, and the calling
    /// thread must be the one that owns this allocator instance. Violations
    /// are undefined behaviour in release builds; debug builds assert at the
    /// chunk boundary.
    pub unsafe fn deallocate(&mut self, p: NonNull<u8>) {
        debug_assert!(!self.chunks.is_empty(), "deallocate on a pool with no chunks");

        let index = self.vicinity_find(p);
        self.dealloc_hint = Some(index);
        // Safety: vicinity_find proved p lies inside chunk `index`; the
        // caller guarantees it is a live block of this pool's block size.
        unsafe { self.chunks[index].deallocate(p, self.block_size) };

        if self.chunks[index].available() == self.num_blocks {
            self.retire_or_park(index);
        }
    }

    /// Map an interior pointer back to its owning chunk.
    ///
    /// Two cursors step outward from the previous deallocation's chunk,
    /// testing containment alternately toward the front and the back.
    /// Deallocations cluster by chunk, so the hit is usually immediate.
    fn vicinity_find(&self, p: NonNull<u8>) -> usize {
        let chunk_len = self.block_size * self.num_blocks as usize;
        let start = self
            .dealloc_hint
            .expect("dealloc hint unset while blocks are outstanding");
        debug_assert!(start < self.chunks.len());

        let mut lo = Some(start);
        let mut hi = if start + 1 < self.chunks.len() {
            Some(start + 1)
        } else {
            None
        };

        while lo.is_some() || hi.is_some() {
            if let Some(i) = lo {
                if self.chunks[i].has_block(p, chunk_len) {
                    return i;
                }
                lo = i.checked_sub(1);
            }
            if let Some(i) = hi {
                if self.chunks[i].has_block(p, chunk_len) {
                    return i;
                }
                hi = if i + 1 < self.chunks.len() {
                    Some(i + 1)
                } else {
                    None
                };
            }
        }
        // Reaching this point means the caller broke the contract; failing
        // loudly beats walking off into undefined behaviour.
        panic!(
            "pointer {:p} was not allocated by this pool (block size {})",
            p.as_ptr(),
            self.block_size
        );
    }

    /// Empty-chunk retention policy, applied after chunk `index` became
    /// fully empty. At most one empty chunk survives, parked at the tail.
    fn retire_or_park(&mut self, index: usize) {
        let last = self.chunks.len() - 1;

        if index == last {
            // The emptied chunk already sits at the tail. It stays as the
            // spare unless the chunk before it is empty too, in which case
            // the tail is released and both hints fall back to the front.
            if last > 0 && self.chunks[last - 1].available() == self.num_blocks {
                self.release_tail();
                self.alloc_hint = Some(0);
                self.dealloc_hint = Some(0);
            }
            return;
        }

        if self.chunks[last].available() == self.num_blocks {
            // A spare is already parked at the tail; release it in favour
            // of the newly emptied chunk.
            self.release_tail();
            self.alloc_hint = Some(index);
            let last = self.chunks.len() - 1;
            if last == index || self.chunks[last].available() == self.num_blocks {
                return;
            }
        }

        // Park the emptied chunk at the tail and make the tail the next
        // allocation candidate. The hint then points at the just-emptied
        // spare, so the next allocation refills warm memory (see DESIGN.md).
        let last = self.chunks.len() - 1;
        self.chunks.swap(index, last);
        self.alloc_hint = Some(last);
    }

    fn release_tail(&mut self) {
        let mut dead = self
            .chunks
            .pop()
            .expect("release_tail on a pool with no chunks");
        dead.release(self.block_size, self.num_blocks);
    }

    /// Walk every chunk's free list and assert the structural invariants:
    /// each walk yields exactly `available` distinct in-range indices.
    #[cfg(test)]
    pub(crate) fn assert_free_lists_consistent(&self) {
        use std::collections::HashSet;
        for chunk in &self.chunks {
            let walk = chunk.free_list_indices(self.block_size);
            assert_eq!(walk.len(), chunk.available() as usize);
            let unique: HashSet<_> = walk.iter().collect();
            assert_eq!(unique.len(), walk.len(), "free list revisits a block");
            assert!(walk.iter().all(|&i| (i as usize) < self.num_blocks as usize));
        }
    }
}

impl Drop for FixedAllocator {
    fn drop(&mut self) {
        for chunk in &mut self.chunks {
            debug_assert_eq!(
                chunk.available(),
                self.num_blocks,
                "pool for block size {} dropped with live blocks",
                self.block_size
            );
            chunk.release(self.block_size, self.num_blocks);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_allocator_geometry_clamp() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // 4096 / 16 = 256, clamped to the one-byte index cap.
        assert_eq!(FixedAllocator::new(16, 4096).num_blocks(), 255);
        // 4096 / 64 = 64 fits.
        assert_eq!(FixedAllocator::new(64, 4096).num_blocks(), 64);
        // Block larger than the chunk target still gets one block per chunk.
        assert_eq!(FixedAllocator::new(8192, 4096).num_blocks(), 1);
    }

    #[test]
    fn test_allocate_grows_and_reuses_partial_chunks() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = FixedAllocator::new(16, 64); // 4 blocks per chunk

        let mut ptrs = Vec::new();
        for _ in 0..8 {
            ptrs.push(pool.allocate().unwrap());
        }
        assert_eq!(pool.chunk_count(), 2);
        assert_eq!(pool.free_blocks(), 0);

        // Free one block from the first chunk; the scan must find it before
        // growing a third chunk.
        // Safety: Test code.
        unsafe { pool.deallocate(ptrs[0]) };
        let p = pool.allocate().unwrap();
        assert_eq!(p, ptrs[0]);
        assert_eq!(pool.chunk_count(), 2);
        ptrs[0] = p;

        for p in ptrs {
            // Safety: Test code.
            unsafe { pool.deallocate(p) };
        }
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_used_block_accounting() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = FixedAllocator::new(24, 96); // 4 blocks per chunk
        let mut live = Vec::new();

        for _ in 0..10 {
            live.push(pool.allocate().unwrap());
        }
        // Safety: Test code.
        unsafe {
            pool.deallocate(live.pop().unwrap());
            pool.deallocate(live.pop().unwrap());
            pool.deallocate(live.pop().unwrap());
        }

        // k allocations minus d deallocations blocks are marked used.
        let used = pool.chunk_count() * pool.num_blocks() as usize - pool.free_blocks();
        assert_eq!(used, 7);
        pool.assert_free_lists_consistent();

        for p in live {
            // Safety: Test code.
            unsafe { pool.deallocate(p) };
        }
    }

    #[test]
    fn test_round_trip_permutations_end_with_single_spare() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // In-order, reverse, and even/odd interleave over three chunks.
        for perm in 0..3 {
            let mut pool = FixedAllocator::new(32, 128); // 4 blocks per chunk
            let ptrs: Vec<_> = (0..12).map(|_| pool.allocate().unwrap()).collect();
            assert_eq!(pool.chunk_count(), 3);

            let order: Vec<usize> = match perm {
                0 => (0..12).collect(),
                1 => (0..12).rev().collect(),
                _ => (0..12).step_by(2).chain((0..12).skip(1).step_by(2)).collect(),
            };
            for i in order {
                // Safety: Test code.
                unsafe { pool.deallocate(ptrs[i]) };
                pool.assert_free_lists_consistent();
            }

            assert_eq!(pool.chunk_count(), 1, "permutation {perm}");
            assert_eq!(pool.free_blocks(), 4, "permutation {perm}");
        }
    }

    #[test]
    fn test_retention_keeps_one_spare_not_two() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // 255 blocks per chunk, allocate 256 so a second chunk is created,
        // then free in allocation order. Exactly one empty chunk must
        // survive.
        let mut pool = FixedAllocator::new(16, 4096);
        assert_eq!(pool.num_blocks(), 255);

        let ptrs: Vec<_> = (0..256).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.chunk_count(), 2);

        for p in ptrs {
            // Safety: Test code.
            unsafe { pool.deallocate(p) };
        }
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.free_blocks(), 255);
    }

    #[test]
    fn test_spare_chunk_damps_capacity_oscillation() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = FixedAllocator::new(16, 64); // 4 blocks per chunk

        // Fill one chunk exactly, then oscillate across the boundary.
        let mut ptrs: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        for _ in 0..8 {
            ptrs.push(pool.allocate().unwrap());
            assert_eq!(pool.chunk_count(), 2);
            // Safety: Test code.
            unsafe { pool.deallocate(ptrs.pop().unwrap()) };
            // The emptied second chunk is parked, not released, so the next
            // push does not pay for a fresh chunk.
            assert_eq!(pool.chunk_count(), 2);
        }

        for p in ptrs {
            // Safety: Test code.
            unsafe { pool.deallocate(p) };
        }
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_vicinity_search_after_growth() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = FixedAllocator::new(16, 64); // 4 blocks per chunk
        let ptrs: Vec<_> = (0..12).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.chunk_count(), 3);

        // Free a pointer from the first chunk: the hint must land there.
        // Safety: Test code.
        unsafe { pool.deallocate(ptrs[0]) };
        assert_eq!(pool.dealloc_hint(), Some(0));

        // A pointer from the third chunk must still be found from that hint.
        // Safety: Test code.
        unsafe { pool.deallocate(ptrs[11]) };
        assert_eq!(pool.dealloc_hint(), Some(2));

        for p in &ptrs[1..11] {
            // Safety: Test code.
            unsafe { pool.deallocate(*p) };
        }
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn test_allocate_absurd_block_size_returns_error_not_panic() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = FixedAllocator::new(usize::MAX / 2, 4096);
        assert_eq!(pool.num_blocks(), 1);

        let result = pool.allocate();
        assert!(matches!(result, Err(PoolError::OutOfMemory { .. })));
        // Strong safety: the failed chunk was never linked in.
        assert_eq!(pool.chunk_count(), 0);
    }
}
