use super::chunk::PoolError;
use super::manager::{PoolConfig, PoolManager};
use crate::sync::cell::UnsafeCell;
use crate::sync::thread::{self, ThreadId};
use crate::sync::RwLock;
use std::collections::HashMap;
use std::ptr::NonNull;

/// One per-thread pool slot in the registry.
///
/// # Safety
///
/// `pool` is wrapped in `UnsafeCell` because it is only ever accessed by
/// the thread whose `ThreadId` keys it — the registry hands out `&mut
/// PoolManager` solely to that thread, so no two `&mut` borrows can coexist
/// even while other threads hold the registry's read lock. The box keeps
/// the cell's address stable across map rehashes.
struct Shard {
    pool: Box<UnsafeCell<PoolManager>>,
}

// Safety: the PoolManager inside is only touched by its owning thread while
// the shard is registered; ownership transfers wholesale (for drop) only
// once no thread can reach it.
unsafe impl Send for Shard {}
// Safety: shared references to a Shard never expose the PoolManager to a
// thread other than the keyed owner (see with_shard).
unsafe impl Sync for Shard {}

/// A registry mapping thread identity to a per-thread [`PoolManager`].
///
/// The second multi-threading pattern from the concurrency model: one
/// shared handle, one pool per thread behind it. The `RwLock` guards only
/// registry lookup and insertion — the per-thread pools themselves stay
/// lock-free, and an allocation with its matching deallocation must occur
/// on the same thread, exactly as with a thread-local instance.
///
/// Dropping the registry drops every per-thread pool; debug builds assert
/// at that point that no blocks are still outstanding.
pub struct ShardedPool {
    shards: RwLock<HashMap<ThreadId, Shard>>,
    config: PoolConfig,
}

impl Default for ShardedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedPool {
    /// Create an empty registry whose per-thread pools use the default
    /// configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create an empty registry; each thread's pool is built from `config`
    /// on that thread's first allocation.
    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Allocate `size` bytes from the calling thread's pool, creating the
    /// pool on first use.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the per-thread pool cannot be built from the
    /// registry's configuration or the system allocator fails.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        self.with_shard(|pool| pool.allocate(size))?
    }

    /// Release a buffer previously returned by [`allocate`](Self::allocate)
    /// **on this same thread** with this same `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this registry's `allocate(size)` on the
    /// calling thread and must not have been released since. Cross-thread
    /// deallocation is undefined behaviour: the pointer would be offered to
    /// a pool that has never seen it.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // The shard exists: allocate() ran on this thread first (caller
        // contract), and shards are never removed while the registry lives,
        // so shard creation — the only fallible step — cannot fire here.
        let done = self.with_shard(|pool| {
            // Safety: upheld by caller.
            unsafe { pool.deallocate(ptr, size) };
        });
        debug_assert!(done.is_ok());
    }

    /// Number of threads that have touched this registry.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shards.read().unwrap().len()
    }

    /// Resolve the calling thread's shard — read lock on the hit path, one
    /// write-locked insertion on first touch — and run `f` on its pool.
    /// The outer error is shard creation failing; `f`'s own result is the
    /// success value.
    fn with_shard<R>(&self, f: impl FnOnce(&mut PoolManager) -> R) -> Result<R, PoolError> {
        let id = thread::current().id();

        {
            let map = self.shards.read().unwrap();
            if let Some(shard) = map.get(&id) {
                // Safety: this thread is the shard's keyed owner; no other
                // thread dereferences this cell (struct-level safety note).
                let pool = crate::sync::unsafe_cell_get_mut!(shard.pool);
                return Ok(f(pool));
            }
        }

        let mut map = self.shards.write().unwrap();
        let shard = match map.entry(id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let pool = PoolManager::with_config(self.config.clone())?;
                e.insert(Shard {
                    pool: Box::new(UnsafeCell::new(pool)),
                })
            }
        };
        // Safety: as above — only the owning thread reaches this cell.
        let pool = crate::sync::unsafe_cell_get_mut!(shard.pool);
        Ok(f(pool))
    }
}
