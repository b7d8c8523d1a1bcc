//! Allocation statistics counters (feature = "stats").
//!
//! Counters use `Relaxed` ordering: they are observational and never used
//! for synchronization — the allocator's own locks provide the ordering
//! that matters. Read them with [`snapshot()`]; individual loads are
//! atomic but the snapshot as a whole is not globally consistent, which
//! is fine for monitoring.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Calls to `allocate` (facade or `GlobalAlloc`) with size > 0.
    pub alloc_count: AtomicU64,
    /// Calls to `deallocate` with size > 0.
    pub dealloc_count: AtomicU64,
    /// Sum of requested bytes across all allocations.
    pub alloc_bytes: AtomicU64,

    /// Allocations served off a thread-local list (no lock taken).
    pub thread_cache_hits: AtomicU64,
    /// Thread-cache misses that went to the central cache for a batch.
    pub thread_cache_misses: AtomicU64,
    /// Times a thread list overflowed and drained half back.
    pub thread_cache_drains: AtomicU64,

    /// Spans carved and sliced for a size class.
    pub spans_sliced: AtomicU64,
    /// Fully idle spans handed back to the page heap.
    pub spans_reclaimed: AtomicU64,

    /// Times a free span was split to satisfy an allocation.
    pub span_splits: AtomicU64,
    /// Times adjacent free spans were merged.
    pub span_coalesces: AtomicU64,

    /// Calls into `platform::page_alloc` from the page heap.
    pub os_alloc_count: AtomicU64,
    /// Bytes requested from the OS by the page heap.
    pub os_alloc_bytes: AtomicU64,

    /// Requests above MAX_SMALL served straight from the OS.
    pub large_allocs: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            thread_cache_hits: AtomicU64::new(0),
            thread_cache_misses: AtomicU64::new(0),
            thread_cache_drains: AtomicU64::new(0),
            spans_sliced: AtomicU64::new(0),
            spans_reclaimed: AtomicU64::new(0),
            span_splits: AtomicU64::new(0),
            span_coalesces: AtomicU64::new(0),
            os_alloc_count: AtomicU64::new(0),
            os_alloc_bytes: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// Point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub alloc_bytes: u64,
    pub thread_cache_hits: u64,
    pub thread_cache_misses: u64,
    pub thread_cache_drains: u64,
    pub spans_sliced: u64,
    pub spans_reclaimed: u64,
    pub span_splits: u64,
    pub span_coalesces: u64,
    pub os_alloc_count: u64,
    pub os_alloc_bytes: u64,
    pub large_allocs: u64,
}

/// Load every counter with `Relaxed` ordering.
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        thread_cache_hits: s.thread_cache_hits.load(Ordering::Relaxed),
        thread_cache_misses: s.thread_cache_misses.load(Ordering::Relaxed),
        thread_cache_drains: s.thread_cache_drains.load(Ordering::Relaxed),
        spans_sliced: s.spans_sliced.load(Ordering::Relaxed),
        spans_reclaimed: s.spans_reclaimed.load(Ordering::Relaxed),
        span_splits: s.span_splits.load(Ordering::Relaxed),
        span_coalesces: s.span_coalesces.load(Ordering::Relaxed),
        os_alloc_count: s.os_alloc_count.load(Ordering::Relaxed),
        os_alloc_bytes: s.os_alloc_bytes.load(Ordering::Relaxed),
        large_allocs: s.large_allocs.load(Ordering::Relaxed),
    }
}
