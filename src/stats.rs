//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering: they are observational only, never
//! used for synchronization. The allocator's spinlocks already provide
//! whatever ordering correctness needs; these are for monitoring.
//!
//! Compiled out entirely unless the `stats` feature is enabled (see
//! [`crate::stat_inc`] / [`crate::stat_add`]).

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    pub alloc_count: AtomicU64,
    pub dealloc_count: AtomicU64,
    pub alloc_bytes: AtomicU64,

    pub thread_cache_hits: AtomicU64,
    pub thread_cache_misses: AtomicU64,
    pub central_cache_hits: AtomicU64,
    pub page_cache_allocs: AtomicU64,

    pub os_alloc_count: AtomicU64,
    pub os_alloc_bytes: AtomicU64,
    pub span_splits: AtomicU64,
    pub span_coalesces: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            thread_cache_hits: AtomicU64::new(0),
            thread_cache_misses: AtomicU64::new(0),
            central_cache_hits: AtomicU64::new(0),
            page_cache_allocs: AtomicU64::new(0),
            os_alloc_count: AtomicU64::new(0),
            os_alloc_bytes: AtomicU64::new(0),
            span_splits: AtomicU64::new(0),
            span_coalesces: AtomicU64::new(0),
        }
    }
}

#[cfg(feature = "stats")]
pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Each field is individually atomic but the snapshot as a whole is not
/// globally consistent: concurrent allocations may race between loads.
/// Fine for monitoring, not for exact accounting.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub alloc_bytes: u64,
    pub thread_cache_hits: u64,
    pub thread_cache_misses: u64,
    pub central_cache_hits: u64,
    pub page_cache_allocs: u64,
    pub os_alloc_count: u64,
    pub os_alloc_bytes: u64,
    pub span_splits: u64,
    pub span_coalesces: u64,
}

/// Take a snapshot of all counters. Returns all-zero when the `stats`
/// feature is disabled.
#[cfg(feature = "stats")]
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        thread_cache_hits: s.thread_cache_hits.load(Ordering::Relaxed),
        thread_cache_misses: s.thread_cache_misses.load(Ordering::Relaxed),
        central_cache_hits: s.central_cache_hits.load(Ordering::Relaxed),
        page_cache_allocs: s.page_cache_allocs.load(Ordering::Relaxed),
        os_alloc_count: s.os_alloc_count.load(Ordering::Relaxed),
        os_alloc_bytes: s.os_alloc_bytes.load(Ordering::Relaxed),
        span_splits: s.span_splits.load(Ordering::Relaxed),
        span_coalesces: s.span_coalesces.load(Ordering::Relaxed),
    }
}

#[cfg(not(feature = "stats"))]
pub fn snapshot() -> Snapshot {
    Snapshot::default()
}
