use super::chunk::{block_align, PoolError};
use super::fixed::FixedAllocator;
use super::stats;
use std::alloc::Layout;
use std::ptr::NonNull;

/// Target byte size of one chunk. Each size class derives its blocks-per-
/// chunk count from this.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Size threshold for pooling. Requests strictly larger go to the system
/// allocator.
pub const MAX_SMALL_OBJECT_SIZE: usize = 256;

/// Configuration for [`PoolManager`]. All fields have sensible defaults.
/// Set at construction time via [`PoolManager::with_config`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Target chunk byte size. Default: [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: usize,
    /// Pool-vs-system size threshold. Default: [`MAX_SMALL_OBJECT_SIZE`].
    pub max_object_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_object_size: MAX_SMALL_OBJECT_SIZE,
        }
    }
}

/// Snapshot of one manager's structure. Computed on demand from the pool
/// itself, unlike the process-wide gauges in [`global_stats`].
///
/// [`global_stats`]: super::stats::global_stats
#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
    /// Live size classes (one FixedAllocator each).
    pub size_classes: usize,
    /// Chunks across all size classes.
    pub chunks: usize,
    /// Bytes held in chunk backing buffers.
    pub chunk_bytes: usize,
    /// Free blocks across all size classes.
    pub free_blocks: usize,
    /// Blocks currently handed out across all size classes.
    pub used_blocks: usize,
}

/// Top-level dispatch: a sequence of [`FixedAllocator`]s sorted strictly
/// ascending by block size, one per live request size.
///
/// A request of `n` bytes is served by the allocator whose block size is
/// exactly `n`, created on first use; requests above the size threshold
/// bypass the pool entirely. One-slot hint caches make repeated-size
/// workloads skip the binary search on both paths.
///
/// A `PoolManager` is single-threaded: it takes `&mut self` everywhere and
/// is deliberately not `Sync`. For multi-threaded programs use one instance
/// per thread ([`with_thread_pool`]) or a [`ShardedPool`]; an allocation and
/// its matching deallocation must happen on the same thread either way.
///
/// [`with_thread_pool`]: super::adapter::with_thread_pool
/// [`ShardedPool`]: super::registry::ShardedPool
pub struct PoolManager {
    /// Sorted strictly ascending by block size; no two entries share one.
    pool: Vec<FixedAllocator>,
    /// Index of the allocator that served the previous allocation.
    last_alloc: Option<usize>,
    /// Index of the allocator that served the previous deallocation.
    last_dealloc: Option<usize>,
    chunk_size: usize,
    max_object_size: usize,
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolManager {
    /// Create a manager with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default()).expect("default config is valid")
    }

    /// Create a manager with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if `chunk_size` or
    /// `max_object_size` is zero.
    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        if config.chunk_size == 0 {
            return Err(PoolError::InvalidConfig("chunk_size must be non-zero".into()));
        }
        if config.max_object_size == 0 {
            return Err(PoolError::InvalidConfig(
                "max_object_size must be non-zero".into(),
            ));
        }
        Ok(Self {
            pool: Vec::new(),
            last_alloc: None,
            last_dealloc: None,
            chunk_size: config.chunk_size,
            max_object_size: config.max_object_size,
        })
    }

    /// The pool-vs-system size threshold this manager was built with.
    #[inline]
    #[must_use]
    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    /// Allocate an uninitialised buffer of at least `size` bytes.
    ///
    /// Zero-size requests are normalised to one byte. Requests above the
    /// size threshold are forwarded to the system allocator; everything
    /// else dispatches to the size-class pool, creating it on first use.
    /// The buffer is aligned to the largest power of two dividing the
    /// (normalised) request size, and no stronger.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::OutOfMemory` if the system allocator fails. The
    /// manager's state is unchanged by a failed call.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let size = size.max(1);
        if size > self.max_object_size {
            return Self::system_allocate(size);
        }

        if let Some(i) = self.last_alloc {
            if self.pool[i].block_size() == size {
                return self.pool[i].allocate();
            }
        }

        let i = match self.pool.binary_search_by(|fa| fa.block_size().cmp(&size)) {
            Ok(i) => i,
            Err(insert_at) => {
                self.pool
                    .insert(insert_at, FixedAllocator::new(size, self.chunk_size));
                // Index hints at or after the insertion point shift right.
                if let Some(j) = self.last_alloc.as_mut() {
                    if *j >= insert_at {
                        *j += 1;
                    }
                }
                match self.last_dealloc.as_mut() {
                    Some(j) if *j >= insert_at => *j += 1,
                    Some(_) => {}
                    None => self.last_dealloc = Some(0),
                }
                insert_at
            }
        };
        self.last_alloc = Some(i);
        self.pool[i].allocate()
    }

    /// Release a buffer previously returned by [`allocate`](Self::allocate)
    /// on this same manager with this same `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this manager's `allocate(size)`, must not
    /// have been released since, and the call must happen on the thread
    /// that owns this manager. Double frees, foreign pointers, and size
    /// mismatches are undefined behaviour in release builds.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let size = size.max(1);
        if size > self.max_object_size {
            // Safety: forwarded pointers were produced by system_allocate
            // with the identical layout computation.
            unsafe { Self::system_deallocate(ptr, size) };
            return;
        }

        if let Some(i) = self.last_dealloc {
            if self.pool[i].block_size() == size {
                // Safety: upheld by caller.
                unsafe { self.pool[i].deallocate(ptr) };
                return;
            }
        }

        let Ok(i) = self.pool.binary_search_by(|fa| fa.block_size().cmp(&size)) else {
            panic!("deallocate of size {size} with no matching size class");
        };
        self.last_dealloc = Some(i);
        // Safety: upheld by caller.
        unsafe { self.pool[i].deallocate(ptr) };
    }

    // Forwarded buffers carry the same alignment guarantee as pooled ones:
    // the largest power of two dividing the request size. Both sides of the
    // forwarded round trip compute the identical layout.
    fn oversize_layout(size: usize) -> Result<Layout, PoolError> {
        Layout::from_size_align(size, block_align(size))
            .map_err(|_| PoolError::OutOfMemory { size })
    }

    fn system_allocate(size: usize) -> Result<NonNull<u8>, PoolError> {
        let layout = Self::oversize_layout(size)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(PoolError::OutOfMemory { size })?;
        stats::OVERSIZE_BYTES.add(size);
        Ok(ptr)
    }

    unsafe fn system_deallocate(ptr: NonNull<u8>, size: usize) {
        let layout = Self::oversize_layout(size).expect("layout was valid at allocation");
        // Safety: ptr came from system_allocate(size), which used this
        // exact layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        stats::sub_saturating(&stats::OVERSIZE_BYTES, size);
    }

    /// Per-instance structural snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut s = PoolStats {
            size_classes: self.pool.len(),
            chunks: 0,
            chunk_bytes: 0,
            free_blocks: 0,
            used_blocks: 0,
        };
        for fa in &self.pool {
            let capacity = fa.chunk_count() * fa.num_blocks() as usize;
            s.chunks += fa.chunk_count();
            s.chunk_bytes += fa.chunk_count() * fa.block_size() * fa.num_blocks() as usize;
            s.free_blocks += fa.free_blocks();
            s.used_blocks += capacity - fa.free_blocks();
        }
        s
    }

    #[cfg(test)]
    pub(crate) fn block_sizes(&self) -> Vec<usize> {
        self.pool.iter().map(FixedAllocator::block_size).collect()
    }
}
