//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent; cross-counter snapshots may be transiently
//! inconsistent when many thread-local pools mutate them at once. This is
//! acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes currently held in chunk backing buffers, across every pool instance
// in the process.
crate::sync::static_atomic! {
    pub static POOL_CHUNK_BYTES: Counter = Counter::new();
}
// Count of live chunks across every pool instance.
crate::sync::static_atomic! {
    pub static POOL_CHUNKS_LIVE: Counter = Counter::new();
}
// Bytes currently forwarded to the system allocator because the request
// exceeded the size threshold.
crate::sync::static_atomic! {
    pub static OVERSIZE_BYTES: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Process-wide snapshot of the diagnostic counters.
#[derive(Clone, Copy, Debug)]
pub struct GlobalStats {
    pub pool_chunk_bytes: usize,
    pub pool_chunks_live: usize,
    pub oversize_bytes: usize,
}

/// Read the process-wide counters. Values are eventually consistent.
#[must_use]
pub fn global_stats() -> GlobalStats {
    GlobalStats {
        pool_chunk_bytes: POOL_CHUNK_BYTES.load(Ordering::Relaxed),
        pool_chunks_live: POOL_CHUNKS_LIVE.load(Ordering::Relaxed),
        oversize_bytes: OVERSIZE_BYTES.load(Ordering::Relaxed),
    }
}
