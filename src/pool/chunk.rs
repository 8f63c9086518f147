use super::stats;
use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

#[derive(Debug)]
pub enum PoolError {
    /// The system allocator failed while growing a pool. The pool's state is
    /// unchanged: the chunk that could not be allocated was never linked in.
    OutOfMemory { size: usize },
    /// A `PoolConfig` was rejected at construction time.
    InvalidConfig(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::OutOfMemory { size } => {
                write!(f, "system allocator failed to provide {size} bytes")
            }
            PoolError::InvalidConfig(msg) => write!(f, "invalid pool configuration: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Alignment of every block handed out for `block_size`: the largest power
/// of two dividing the block size. Blocks sit at multiples of `block_size`
/// inside a buffer with this alignment, so each block inherits it.
#[inline]
pub(crate) fn block_align(block_size: usize) -> usize {
    debug_assert!(block_size > 0);
    1 << block_size.trailing_zeros()
}

/// One contiguous slab holding up to 255 fixed-size blocks.
///
/// Free blocks form an intrusive singly-linked list: the first byte of each
/// free block stores the index of the next free block. A freshly reset chunk
/// therefore has `1, 2, …, blocks` written into its block heads. The
/// one-byte link is why a chunk can never hold more than 255 blocks.
///
/// A chunk does not know its own geometry; the owning [`FixedAllocator`]
/// passes `block_size` (and `blocks` where needed) into every call, exactly
/// as it passes them to [`Chunk::init`].
///
/// [`FixedAllocator`]: super::fixed::FixedAllocator
pub(crate) struct Chunk {
    /// Owned buffer of `block_size * blocks` bytes.
    data: NonNull<u8>,
    /// Index of the free-list head; equals the block count when the list is
    /// empty.
    first_available: u8,
    /// Count of free blocks, always the length of the list reachable from
    /// `first_available`.
    available: u8,
    /// Debug-only shadow of the free list: bit set = block free. Catches
    /// double frees and frees of never-allocated blocks, which the release
    /// build leaves undefined.
    #[cfg(debug_assertions)]
    free_map: FixedBitSet,
}

// Safety: Chunk owns its buffer; the raw pointer is not shared.
unsafe impl Send for Chunk {}

impl Chunk {
    /// Allocate the backing buffer and write the pristine free list.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::OutOfMemory` if the system allocator fails or the
    /// requested geometry does not form a valid layout.
    pub(crate) fn init(block_size: usize, blocks: u8) -> Result<Self, PoolError> {
        debug_assert!(block_size > 0);
        debug_assert!(blocks > 0);
        // Overflow check; in release builds the caller guarantees the pair
        // fits (blocks <= 255 and block_size <= the size threshold).
        debug_assert!(
            block_size.checked_mul(blocks as usize).is_some(),
            "block_size * blocks overflows"
        );

        let layout = Self::layout(block_size, blocks)?;
        // Safety: layout has non-zero size (block_size > 0, blocks > 0).
        let ptr = unsafe { std::alloc::alloc(layout) };
        let data = NonNull::new(ptr).ok_or(PoolError::OutOfMemory { size: layout.size() })?;

        stats::POOL_CHUNK_BYTES.add(layout.size());
        stats::POOL_CHUNKS_LIVE.add(1);

        let mut chunk = Self {
            data,
            first_available: 0,
            available: 0,
            #[cfg(debug_assertions)]
            free_map: FixedBitSet::with_capacity(blocks as usize),
        };
        chunk.reset(block_size, blocks);
        Ok(chunk)
    }

    fn layout(block_size: usize, blocks: u8) -> Result<Layout, PoolError> {
        let size = block_size * blocks as usize;
        Layout::from_size_align(size, block_align(block_size))
            .map_err(|_| PoolError::OutOfMemory { size })
    }

    /// Rewrite the intrusive free list over an already-allocated buffer:
    /// block `i` gets the byte value `i + 1` at its head.
    pub(crate) fn reset(&mut self, block_size: usize, blocks: u8) {
        debug_assert!(block_size > 0);
        debug_assert!(blocks > 0);

        self.first_available = 0;
        self.available = blocks;

        let mut p = self.data.as_ptr();
        for i in 1..=blocks {
            // Safety: p walks block heads inside the owned buffer; the last
            // write lands at offset (blocks - 1) * block_size.
            unsafe {
                *p = i;
                p = p.add(block_size);
            }
        }

        #[cfg(debug_assertions)]
        {
            self.free_map.grow(blocks as usize);
            self.free_map.set_range(.., true);
        }
    }

    /// Pop a block off the free list. O(1), never fails while blocks remain.
    pub(crate) fn allocate(&mut self, block_size: usize) -> Option<NonNull<u8>> {
        if self.available == 0 {
            return None;
        }

        let index = self.first_available as usize;
        // Safety: index came off the free list, so index < blocks and the
        // offset is inside the owned buffer.
        let p = unsafe { self.data.as_ptr().add(index * block_size) };

        #[cfg(debug_assertions)]
        {
            assert!(
                self.free_map.contains(index),
                "free list yielded block {index}, which is not free (corrupted list?)"
            );
            self.free_map.set(index, false);
        }

        // Safety: the head byte of a free block holds the next free index.
        self.first_available = unsafe { *p };
        self.available -= 1;

        // Safety: p points into the owned buffer.
        Some(unsafe { NonNull::new_unchecked(p) })
    }

    /// Push a block back onto the free list. O(1).
    ///
    /// # Safety
    ///
    /// `p` must be the start of a block previously returned by
    /// [`allocate`](Self::allocate) on this chunk with the same
    /// `block_size`, and must not already be free. Neither is detected in
    /// release builds; a double free silently corrupts the list.
    pub(crate) unsafe fn deallocate(&mut self, p: NonNull<u8>, block_size: usize) {
        let base = self.data.as_ptr() as usize;
        let addr = p.as_ptr() as usize;
        debug_assert!(addr >= base, "pointer below chunk base");

        let offset = addr - base;
        debug_assert!(
            offset % block_size == 0,
            "pointer not aligned to a block boundary"
        );
        let index = offset / block_size;
        // Truncation check: the index must survive the round trip through
        // the one-byte link field.
        debug_assert!(index <= u8::MAX as usize);

        #[cfg(debug_assertions)]
        {
            assert!(
                !self.free_map.contains(index),
                "double free of block {index}"
            );
            self.free_map.set(index, true);
        }

        // Safety: p is a block head inside the owned buffer (caller
        // contract); writing one byte links it into the list.
        unsafe {
            *p.as_ptr() = self.first_available;
        }
        self.first_available = index as u8;
        self.available += 1;
    }

    /// Return the backing buffer to the system allocator. Must be called
    /// exactly once, with the geometry used at `init`, before the chunk is
    /// discarded; the owning FixedAllocator guarantees both.
    pub(crate) fn release(&mut self, block_size: usize, blocks: u8) {
        let layout =
            Self::layout(block_size, blocks).expect("layout was validated by Chunk::init");
        // Safety: data was allocated in init with this exact layout and has
        // not been freed (release is called once).
        unsafe {
            std::alloc::dealloc(self.data.as_ptr(), layout);
        }
        stats::sub_saturating(&stats::POOL_CHUNK_BYTES, layout.size());
        stats::POOL_CHUNKS_LIVE.sub(1);
    }

    /// Whether `p` points into this chunk's buffer. The unsigned difference
    /// folds the `p >= data` and `p < data + chunk_len` tests into one
    /// comparison.
    #[inline]
    pub(crate) fn has_block(&self, p: NonNull<u8>, chunk_len: usize) -> bool {
        (p.as_ptr() as usize).wrapping_sub(self.data.as_ptr() as usize) < chunk_len
    }

    #[inline]
    pub(crate) fn available(&self) -> u8 {
        self.available
    }

    /// Walk the free list from the head, returning the visited indices.
    /// Stops after `available` hops, so a corrupted list shows up as a
    /// short, duplicated, or out-of-range walk rather than a hang.
    #[cfg(test)]
    pub(crate) fn free_list_indices(&self, block_size: usize) -> Vec<u8> {
        let mut indices = Vec::with_capacity(self.available as usize);
        let mut idx = self.first_available;
        for _ in 0..self.available {
            indices.push(idx);
            // Safety: test-only walk over the owned buffer.
            idx = unsafe { *self.data.as_ptr().add(idx as usize * block_size) };
        }
        indices
    }
}
