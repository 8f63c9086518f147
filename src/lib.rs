pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

// core allocator
pub use pool::fixed::FixedAllocator;
pub use pool::manager::{PoolConfig, PoolManager, PoolStats, DEFAULT_CHUNK_SIZE, MAX_SMALL_OBJECT_SIZE};

// adapters
pub use pool::adapter::{with_thread_pool, PoolBox};
pub use pool::registry::ShardedPool;

// diagnostics
pub use pool::stats::{global_stats, GlobalStats};

// errors
pub use pool::chunk::PoolError;
