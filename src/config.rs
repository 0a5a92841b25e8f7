//! Tunable constants shared across the three cache tiers.
//!
//! These mirror the size-class and page-budget decisions a tcmalloc-style
//! allocator bakes in at compile time: change them here, not at the call
//! sites.

/// log2 of the page size. A page is the allocator's unit of OS-backed memory.
pub const PAGE_SHIFT: usize = 13;
/// Page size in bytes (8 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Allocations above this many bytes skip the thread/central caches and are
/// rounded to whole pages, served directly by the page cache.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size-class buckets. Index 0 is a real bucket (the smallest
/// class, 8 bytes) — unlike the page cache's page-count buckets, there is
/// no unused slot here.
pub const NUM_SIZE_CLASSES: usize = 208;

/// Page-cache free lists are indexed `1..NPAGES-1`; spans of `NPAGES-1` pages
/// or fewer live in the page cache. Anything larger bypasses it and talks to
/// the OS directly.
pub const NPAGES: usize = 129;
/// Largest span size (in pages) the page cache will track.
pub const MAX_PAGES: usize = NPAGES - 1;

/// Lower/upper clamp for `num_move_size`'s batch-size ceiling.
pub const MIN_MOVE: usize = 2;
pub const MAX_MOVE: usize = 512;
