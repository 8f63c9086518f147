use super::chunk::PoolError;
use super::manager::PoolManager;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

thread_local! {
    static THREAD_POOL: RefCell<PoolManager> = RefCell::new(PoolManager::new());
}

/// Run `f` against the current thread's pool manager.
///
/// The manager is created with the default [`PoolConfig`] on first touch and
/// torn down at thread exit; that teardown debug-asserts every block has
/// been returned. Blocks allocated here must be deallocated on this same
/// thread — handing them to another thread's pool is undefined behaviour.
///
/// Nested calls panic: the pool is exclusively borrowed for the duration of
/// `f`.
///
/// [`PoolConfig`]: super::manager::PoolConfig
pub fn with_thread_pool<F, R>(f: F) -> R
where
    F: FnOnce(&mut PoolManager) -> R,
{
    THREAD_POOL.with(|pool| f(&mut pool.borrow_mut()))
}

/// An owning pointer to a `T` stored in the current thread's pool.
///
/// The pooled replacement for `Box<T>` in code that creates and destroys
/// large numbers of small objects: construction routes through
/// [`with_thread_pool`], destruction runs `T`'s destructor and returns the
/// block. Arrays and slices are deliberately not covered — the pool
/// dispatches on the element size alone and cannot recover an array length,
/// so `Vec<T>` and `Box<[T]>` stay on the system allocator.
///
/// `PoolBox` is `!Send` and `!Sync`: the block must return to the pool of
/// the thread that allocated it.
pub struct PoolBox<T> {
    ptr: NonNull<T>,
    /// Owns a `T`; the raw pointer keeps the type `!Send`/`!Sync`.
    _marker: PhantomData<(T, *mut u8)>,
}

impl<T> PoolBox<T> {
    /// Bytes requested from the pool for one `T`. Zero-sized and
    /// over-aligned types round up so the block's alignment (the largest
    /// power of two dividing the request size) covers `align_of::<T>()`.
    const REQUEST_SIZE: usize = {
        let size = std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>();
        if size > align {
            size
        } else {
            align
        }
    };

    /// Move `value` into a pooled block.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::OutOfMemory` if the pool cannot grow; `value` is
    /// dropped in that case.
    ///
    /// # Panics
    ///
    /// Panics if called while the current thread's pool is already borrowed
    /// through [`with_thread_pool`].
    pub fn new(value: T) -> Result<Self, PoolError> {
        let raw = with_thread_pool(|pool| pool.allocate(Self::REQUEST_SIZE))?;
        let ptr = raw.cast::<T>();
        debug_assert_eq!(
            ptr.as_ptr() as usize % std::mem::align_of::<T>(),
            0,
            "pool returned a block misaligned for the target type"
        );
        // Safety: ptr is a fresh block of at least size_of::<T>() bytes,
        // aligned for T per the request-size rounding above.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            _marker: PhantomData,
        })
    }

    /// Non-panicking-on-OOM form of [`new`](Self::new): allocation failure
    /// becomes `None` instead of an error value.
    pub fn try_new(value: T) -> Option<Self> {
        Self::new(value).ok()
    }

    /// Take the value back out, returning the block to the pool without
    /// running `T`'s destructor on the moved-out value twice.
    pub fn into_inner(this: Self) -> T {
        // Safety: ptr owns a live T; `this` is forgotten below so Drop
        // does not run it a second time.
        let value = unsafe { this.ptr.as_ptr().read() };
        let raw = this.ptr.cast::<u8>();
        std::mem::forget(this);
        with_thread_pool(|pool| {
            // Safety: the block came from this thread's pool with this
            // exact request size.
            unsafe { pool.deallocate(raw, Self::REQUEST_SIZE) };
        });
        value
    }
}

impl<T> std::ops::Deref for PoolBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: ptr owns a live, properly-initialised T.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> std::ops::DerefMut for PoolBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: ptr owns a live T and &mut self is exclusive.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for PoolBox<T> {
    fn drop(&mut self) {
        // Safety: ptr owns a live T that has not been dropped.
        unsafe { std::ptr::drop_in_place(self.ptr.as_ptr()) };
        let raw = self.ptr.cast::<u8>();
        with_thread_pool(|pool| {
            // Safety: the block came from this thread's pool with this
            // exact request size.
            unsafe { pool.deallocate(raw, Self::REQUEST_SIZE) };
        });
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for PoolBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_with_thread_pool_round_trip() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let p = with_thread_pool(|pool| pool.allocate(40)).unwrap();
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0x5A, 40);
            assert_eq!(p.as_ptr().add(39).read(), 0x5A);
        }
        with_thread_pool(|pool| {
            // Safety: Test code.
            unsafe { pool.deallocate(p, 40) };
        });
    }

    #[test]
    fn test_pool_box_owns_and_mutates_value() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut b = PoolBox::new([7u32; 4]).unwrap();
        assert_eq!(*b, [7, 7, 7, 7]);
        b[2] = 99;
        assert_eq!(b[2], 99);
    }

    #[test]
    fn test_pool_box_drop_runs_destructor_once() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        struct Probe(Rc<Cell<u32>>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let b = PoolBox::new(Probe(drops.clone())).unwrap();
        assert_eq!(drops.get(), 0);
        drop(b);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_pool_box_into_inner_skips_destructor() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        struct Probe(Rc<Cell<u32>>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let b = PoolBox::new(Probe(drops.clone())).unwrap();
        let probe = PoolBox::into_inner(b);
        assert_eq!(drops.get(), 0);
        drop(probe);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_pool_box_try_new_succeeds() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let b = PoolBox::try_new(1234u64).expect("allocation should succeed");
        assert_eq!(*b, 1234);
    }

    #[test]
    fn test_pool_box_zero_sized_values_get_distinct_blocks() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = PoolBox::new(()).unwrap();
        let b = PoolBox::new(()).unwrap();
        assert_ne!(a.ptr.as_ptr() as usize, b.ptr.as_ptr() as usize);
    }

    #[test]
    fn test_pool_box_respects_alignment() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        #[repr(align(64))]
        struct Aligned(u8);

        let b = PoolBox::new(Aligned(3)).unwrap();
        assert_eq!(b.ptr.as_ptr() as usize % 64, 0);
        assert_eq!(b.0, 3);
    }

    #[test]
    fn test_each_thread_gets_its_own_pool() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let here = with_thread_pool(|pool| pool.allocate(72)).unwrap();

        let handle = crate::sync::thread::spawn(|| {
            // Fresh thread, fresh pool: this allocation must succeed and be
            // fully cleaned up before thread exit.
            let b = PoolBox::new(0xDEAD_BEEFu64).unwrap();
            assert_eq!(*b, 0xDEAD_BEEF);
        });
        handle.join().unwrap();

        with_thread_pool(|pool| {
            // Safety: Test code.
            unsafe { pool.deallocate(here, 72) };
        });
    }
}
