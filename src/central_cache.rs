//! Central Cache (middle tier): a size-class-sharded broker between the page
//! cache and thread caches.
//!
//! Each size class gets its own bucket lock ("the bucket lock"); no two
//! bucket locks are ever held simultaneously, and the page cache's coarse
//! lock is only ever taken after a bucket lock has been dropped. See
//! [`get_one_span`] for where that hand-off happens.

use crate::config::{NUM_SIZE_CLASSES, PAGE_SHIFT, PAGE_SIZE};
use crate::page_cache::PageCache;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span::{FreeObject, Span, SpanList};
use crate::sync::{SpinLock, SpinMutex};
use core::cell::UnsafeCell;
use core::ptr;

struct Bucket {
    mtx: SpinLock,
    spans: UnsafeCell<SpanList>,
}

// SAFETY: `spans` is only touched while `mtx` is held.
unsafe impl Sync for Bucket {}

impl Bucket {
    fn new() -> Self {
        Self {
            mtx: SpinLock::new(),
            spans: UnsafeCell::new(SpanList::new()),
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn list_mut(&self) -> &mut SpanList {
        unsafe { &mut *self.spans.get() }
    }
}

/// The 208-bucket, size-class-sharded central cache. One instance per
/// process, shared by every thread cache.
pub struct CentralCache {
    buckets: [Bucket; NUM_SIZE_CLASSES],
}

impl CentralCache {
    pub fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| Bucket::new()),
        }
    }

    /// Fetch up to `batch` objects of `size` bytes. Returns the actual count
    /// transferred (>= 1) and a null-terminated linked list via `out_tail`.
    ///
    /// # Safety
    /// `page_cache` and `pagemap` must be the global instances.
    pub unsafe fn fetch_range(
        &self,
        size: usize,
        batch: usize,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &'static PageMap,
    ) -> (usize, *mut FreeObject, *mut FreeObject) {
        let idx = size_class::index(size);
        let bucket = &self.buckets[idx];

        bucket.mtx.lock();

        let span = unsafe { get_one_span(bucket, size, page_cache, pagemap) };
        debug_assert!(!span.is_null());
        debug_assert!(unsafe { !(*span).free_list.is_null() });

        let start = unsafe { (*span).free_list };
        let mut end = start;
        let mut actual = 1usize;
        while actual < batch {
            let next = unsafe { (*end).next };
            if next.is_null() {
                break;
            }
            end = next;
            actual += 1;
        }

        unsafe {
            (*span).free_list = (*end).next;
            (*end).next = ptr::null_mut();
            (*span).use_count += actual;
        }

        bucket.mtx.unlock();
        (actual, start, end)
    }

    /// Return a linked list of `size`-byte objects to their owning spans,
    /// handing fully-drained spans back to the page cache.
    ///
    /// # Safety
    /// `start` must be a valid linked list of objects previously obtained
    /// from this allocator at `size` bytes.
    pub unsafe fn release_list(
        &self,
        mut start: *mut FreeObject,
        size: usize,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &'static PageMap,
    ) {
        let idx = size_class::index(size);
        let bucket = &self.buckets[idx];

        bucket.mtx.lock();

        while !start.is_null() {
            let next = unsafe { (*start).next };

            let page_id = (start as usize) >> PAGE_SHIFT;
            let span = pagemap.get(page_id);
            assert!(!span.is_null(), "free of untracked address (double-free or foreign pointer)");

            unsafe {
                (*start).next = (*span).free_list;
                (*span).free_list = start;
                (*span).use_count -= 1;

                if (*span).use_count == 0 {
                    bucket.list_mut().remove(span);
                    (*span).free_list = ptr::null_mut();

                    bucket.mtx.unlock();
                    unsafe { page_cache.lock().release_span(span) };
                    bucket.mtx.lock();
                }
            }

            start = next;
        }

        bucket.mtx.unlock();
    }
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Find (or build) a span with a non-empty free list for `size`-byte
/// objects. On entry and exit, `bucket.mtx` is held by the caller; in
/// between it is dropped so concurrent frees into the same bucket can make
/// progress while this thread talks to the (much slower) page cache.
unsafe fn get_one_span(
    bucket: &Bucket,
    size: usize,
    page_cache: &SpinMutex<PageCache>,
    pagemap: &'static PageMap,
) -> *mut Span {
    let found = unsafe { bucket.list_mut().find(|s| !s.free_list.is_null()) };
    if !found.is_null() {
        return found;
    }

    // No span with room anywhere in this bucket. Drop the bucket lock before
    // taking the (coarser, slower) page lock: holding both at once would
    // invert the lock order and block unrelated frees in this bucket.
    bucket.mtx.unlock();

    let pages = size_class::num_move_page(size);
    let span = {
        let mut pc = page_cache.lock();
        let s = unsafe { pc.new_span(pages) };
        assert!(!s.is_null(), "page cache exhausted");
        unsafe {
            (*s).in_use = true;
            (*s).obj_size = size;
        }
        s
    };

    // No lock held here at all: the span isn't reachable by any other
    // thread yet (it was just carved off by the page cache), so carving its
    // free list needs no synchronization.
    unsafe { carve(span, size) };

    bucket.mtx.lock();
    unsafe { bucket.list_mut().push_front(span) };
    span
}

/// Chain a freshly page-cache-carved span into a free list of `size`-byte
/// objects. Any residual tail bytes (span bytes not a multiple of `size`)
/// are left unallocated.
unsafe fn carve(span: *mut Span, size: usize) {
    unsafe {
        let base = (*span).start_addr();
        let total_bytes = (*span).n * PAGE_SIZE;
        let count = total_bytes / size;

        let mut head: *mut FreeObject = ptr::null_mut();
        for i in (0..count).rev() {
            let obj = base.add(i * size) as *mut FreeObject;
            (*obj).next = head;
            head = obj;
        }
        (*span).free_list = head;
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use crate::page_cache::PageCache;
    use alloc::boxed::Box;

    fn make_env() -> (&'static PageMap, SpinMutex<PageCache>, CentralCache) {
        let pm = Box::leak(Box::new(PageMap::new()));
        let pc = SpinMutex::new(PageCache::new(pm));
        (pm, pc, CentralCache::new())
    }

    #[test]
    fn fetch_populates_from_page_cache() {
        let (pm, pc, cc) = make_env();
        unsafe {
            let (count, head, _tail) = cc.fetch_range(8, 32, &pc, pm);
            assert!(count > 0);
            assert!(!head.is_null());
        }
    }

    #[test]
    fn fetch_then_release_roundtrip() {
        let (pm, pc, cc) = make_env();
        unsafe {
            let (count, head, _tail) = cc.fetch_range(64, 16, &pc, pm);
            assert!(count > 0);
            cc.release_list(head, 64, &pc, pm);
        }
    }

    #[test]
    fn exact_span_carve_for_8_byte_class() {
        let (pm, pc, cc) = make_env();
        unsafe {
            let pages = size_class::num_move_page(8);
            let expected_objects = (pages * PAGE_SIZE) / 8;

            let (count, head, tail) = cc.fetch_range(8, expected_objects, &pc, pm);
            assert_eq!(count, expected_objects);

            cc.release_list(head, 8, &pc, pm);
            let _ = tail;
        }
    }

    #[test]
    fn use_count_tracks_handed_out_objects() {
        let (pm, pc, cc) = make_env();
        unsafe {
            let (count, head, _tail) = cc.fetch_range(32, 10, &pc, pm);
            let page_id = (head as usize) >> PAGE_SHIFT;
            let span = pm.get(page_id);
            assert_eq!((*span).use_count, count);
            cc.release_list(head, 32, &pc, pm);
            assert_eq!((*span).use_count, 0);
        }
    }
}
