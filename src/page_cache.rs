//! Page Cache (back end): the single global page-level allocator.
//!
//! Owns `NPAGES - 1` free lists of idle spans (bucketed by page count),
//! splits and merges them to satisfy the central cache, and falls back to
//! the OS when nothing usable is on hand. Guarded end to end by one coarse
//! `SpinMutex` — see `PageCache::lock()` in `allocator.rs` for why a single
//! lock here is fine: the page cache is only ever touched after a bucket
//! lock in the central cache has been dropped (see `central_cache`).

use crate::config::{MAX_PAGES, NPAGES, PAGE_SHIFT, PAGE_SIZE};
use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{self, Span, SpanList};
use crate::{stat_add, stat_inc};

/// Global page-level allocator. One instance per process.
pub struct PageCache {
    /// `buckets[k]` holds idle spans of exactly `k` pages, `k` in `1..=MAX_PAGES`.
    /// Index 0 is unused.
    buckets: [SpanList; NPAGES],
    pagemap: &'static PageMap,
}

// SAFETY: callers serialize access through the enclosing SpinMutex.
unsafe impl Send for PageCache {}

impl PageCache {
    pub fn new(pagemap: &'static PageMap) -> Self {
        Self {
            buckets: core::array::from_fn(|_| SpanList::new()),
            pagemap,
        }
    }

    /// Obtain a span of at least `k` pages. Precondition: `k >= 1`.
    ///
    /// Spans larger than `MAX_PAGES` bypass the free lists entirely and are
    /// satisfied straight from the OS (the large-object path).
    ///
    /// # Safety
    /// Caller must hold exclusive access to this `PageCache` (its enclosing
    /// `SpinMutex`).
    pub unsafe fn new_span(&mut self, k: usize) -> *mut Span {
        assert!(k >= 1);

        if k > MAX_PAGES {
            return unsafe { self.new_span_from_os(k) };
        }

        if !self.buckets[k].is_empty() {
            let s = unsafe { self.buckets[k].pop_front() };
            unsafe { self.pagemap.register_span(s) };
            return s;
        }

        for j in (k + 1)..NPAGES {
            if self.buckets[j].is_empty() {
                continue;
            }
            let n_span = unsafe { self.buckets[j].pop_front() };
            let k_span = span::alloc_span();
            assert!(!k_span.is_null(), "out of span metadata");

            unsafe {
                (*k_span).page_id = (*n_span).page_id;
                (*k_span).n = k;

                (*n_span).page_id += k;
                (*n_span).n -= k;

                self.buckets[(*n_span).n].push_front(n_span);
                // Idle span: boundary entries are enough for coalescing.
                self.pagemap.register_span_endpoints(n_span);
                // In-use span: full range, needed for object->span lookup.
                self.pagemap.register_span(k_span);
            }
            stat_inc!(span_splits);
            return k_span;
        }

        // Nothing big enough anywhere: grow from the OS by the largest
        // trackable span size, then retry (guaranteed to succeed via the
        // split path above).
        let big = unsafe { self.new_span_from_os(MAX_PAGES) };
        if big.is_null() {
            return core::ptr::null_mut();
        }
        unsafe {
            (*big).in_use = false;
            self.pagemap.register_span_endpoints(big);
            self.buckets[MAX_PAGES].push_front(big);
        }
        unsafe { self.new_span(k) }
    }

    /// The page map backing this cache, for callers (the top-level
    /// allocator) that need to register/unregister spans directly, e.g. when
    /// trimming an over-aligned allocation's prefix/suffix.
    pub fn pagemap(&self) -> &'static PageMap {
        self.pagemap
    }

    /// Look up the span covering `obj`. Lock-free; safe to call without
    /// holding this cache's lock from the central cache's bucket lock, per
    /// the page-map concurrency contract (see `pagemap` module docs).
    ///
    /// # Panics
    /// Panics (abort-equivalent invariant violation) if no span is
    /// registered for the address — indicates a double-free or foreign
    /// pointer.
    pub fn map_object_to_span(&self, obj: *const u8) -> *mut Span {
        let page_id = (obj as usize) >> PAGE_SHIFT;
        let span = self.pagemap.get(page_id);
        assert!(!span.is_null(), "no span registered for address; double-free or foreign pointer");
        span
    }

    /// Return a span to the page cache, coalescing with adjacent idle spans.
    ///
    /// # Safety
    /// `span` must be a valid, currently in-use span. Caller holds this
    /// cache's lock.
    pub unsafe fn release_span(&mut self, span: *mut Span) {
        unsafe {
            if (*span).n > MAX_PAGES {
                let addr = (*span).start_addr();
                platform::page_dealloc(addr, (*span).n * PAGE_SIZE);
                span::dealloc_span(span);
                return;
            }

            (*span).in_use = false;
            (*span).obj_size = 0;
            (*span).free_list = core::ptr::null_mut();
            (*span).use_count = 0;
        }

        let span = unsafe { self.coalesce_left(span) };
        let span = unsafe { self.coalesce_right(span) };

        unsafe {
            self.pagemap.register_span_endpoints(span);
            self.buckets[(*span).n].push_front(span);
        }
    }

    /// Absorb the idle neighbour immediately before `span`, if any. Stops on
    /// a missing map entry, an in-use neighbour, or an oversized merge.
    unsafe fn coalesce_left(&mut self, span: *mut Span) -> *mut Span {
        loop {
            let start = unsafe { (*span).page_id };
            if start == 0 {
                return span;
            }
            let prev = self.pagemap.get(start - 1);
            if prev.is_null() {
                return span;
            }
            unsafe {
                if (*prev).in_use {
                    return span;
                }
                if (*prev).n + (*span).n > MAX_PAGES {
                    return span;
                }
                // Sanity: prev must actually abut span's start.
                if (*prev).page_id + (*prev).n != start {
                    return span;
                }

                self.buckets[(*prev).n].remove(prev);
                (*span).page_id = (*prev).page_id;
                (*span).n += (*prev).n;
                span::dealloc_span(prev);
            }
            stat_inc!(span_coalesces);
        }
    }

    /// Absorb the idle neighbour immediately after `span`, symmetrically.
    unsafe fn coalesce_right(&mut self, span: *mut Span) -> *mut Span {
        loop {
            let end = unsafe { (*span).end_page() };
            let next = self.pagemap.get(end);
            if next.is_null() {
                return span;
            }
            unsafe {
                if (*next).in_use {
                    return span;
                }
                if (*next).n + (*span).n > MAX_PAGES {
                    return span;
                }
                if (*next).page_id != end {
                    return span;
                }

                self.buckets[(*next).n].remove(next);
                (*span).n += (*next).n;
                span::dealloc_span(next);
            }
            stat_inc!(span_coalesces);
        }
    }

    unsafe fn new_span_from_os(&mut self, k: usize) -> *mut Span {
        let ptr = unsafe { platform::page_alloc(k * PAGE_SIZE) };
        if ptr.is_null() {
            return core::ptr::null_mut();
        }
        let s = span::alloc_span();
        if s.is_null() {
            unsafe { platform::page_dealloc(ptr, k * PAGE_SIZE) };
            return core::ptr::null_mut();
        }
        unsafe {
            (*s).page_id = (ptr as usize) >> PAGE_SHIFT;
            (*s).n = k;
            (*s).in_use = true;
            self.pagemap.register_span(s);
        }
        stat_inc!(os_alloc_count);
        stat_add!(os_alloc_bytes, k * PAGE_SIZE);
        s
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::boxed::Box;

    fn make_heap() -> (&'static PageMap, PageCache) {
        let pm = Box::leak(Box::new(PageMap::new()));
        (pm, PageCache::new(pm))
    }

    #[test]
    fn allocate_single_page() {
        let (pm, mut heap) = make_heap();
        unsafe {
            let span = heap.new_span(1);
            assert!(!span.is_null());
            assert!((*span).in_use);
            assert_eq!(pm.get((*span).page_id), span);
            heap.release_span(span);
        }
    }

    #[test]
    fn reuse_after_free() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let s1 = heap.new_span(4);
            heap.release_span(s1);
            let s2 = heap.new_span(4);
            assert!(!s2.is_null());
            heap.release_span(s2);
        }
    }

    #[test]
    fn split_from_larger_span() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let big = heap.new_span(50);
            heap.release_span(big);

            let small = heap.new_span(5);
            assert_eq!((*small).n, 5);
            heap.release_span(small);
        }
    }

    #[test]
    fn coalesce_reunites_adjacent_spans_either_free_order() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let a = heap.new_span(4);
            let b = heap.new_span(4);
            assert_eq!((*b).page_id, (*a).page_id + 4);

            heap.release_span(b);
            heap.release_span(a);

            assert!(heap.buckets[8].count >= 1);
        }
    }

    #[test]
    fn large_span_bypasses_buckets() {
        let (pm, mut heap) = make_heap();
        unsafe {
            let span = heap.new_span(MAX_PAGES + 50);
            assert!(!span.is_null());
            assert_eq!((*span).n, MAX_PAGES + 50);
            assert_eq!(pm.get((*span).page_id), span);
            let page_id = (*span).page_id;
            heap.release_span(span);
            // Large spans are handed straight back to the OS, not coalesced
            // into any bucket.
            let _ = pm;
            let _ = page_id;
        }
    }

    #[test]
    fn map_object_to_span_finds_owner() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let span = heap.new_span(2);
            let addr = (*span).start_addr();
            let found = heap.map_object_to_span(addr);
            assert_eq!(found, span);
            heap.release_span(span);
        }
    }
}
