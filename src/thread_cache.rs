//! Thread Cache (front end): per-thread free lists for lock-free allocation.
//!
//! Each thread owns one `ThreadCache`. The fast path — a hit in a size
//! class's free list — needs no synchronization at all. A miss falls
//! through to the central cache, which does.
//!
//! Growth is slow-start only: a free list's `max_length` begins at 1 and
//! grows by one on every central-cache fetch, capped at
//! [`size_class::num_move_size`] for that size class. There is no
//! low-water-mark scavenging and no global cache-size budget to steal
//! from — every thread cache can grow to the same per-class ceiling.

use crate::central_cache::CentralCache;
use crate::config::NUM_SIZE_CLASSES;
use crate::page_cache::PageCache;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span::FreeObject;
use crate::stat_inc;
use crate::sync::SpinMutex;
use core::ptr;

struct FreeList {
    head: *mut FreeObject,
    length: usize,
    max_length: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            length: 0,
            max_length: 1,
        }
    }

    #[inline]
    fn push(&mut self, obj: *mut FreeObject) {
        unsafe { (*obj).next = self.head };
        self.head = obj;
        self.length += 1;
    }

    #[inline]
    fn push_batch(&mut self, head: *mut FreeObject, tail: *mut FreeObject, count: usize) {
        if head.is_null() || count == 0 {
            return;
        }
        unsafe { (*tail).next = self.head };
        self.head = head;
        self.length += count;
    }

    /// Pop at most `count` objects. Never pops more than are present.
    fn pop_range(&mut self, count: usize) -> (usize, *mut FreeObject, *mut FreeObject) {
        let n = count.min(self.length);
        if n == 0 {
            return (0, ptr::null_mut(), ptr::null_mut());
        }
        let head = self.head;
        let mut tail = head;
        for _ in 1..n {
            tail = unsafe { (*tail).next };
        }
        self.head = unsafe { (*tail).next };
        unsafe { (*tail).next = ptr::null_mut() };
        self.length -= n;
        (n, head, tail)
    }
}

/// Per-thread cache of free objects, one [`FreeList`] per size class.
pub struct ThreadCache {
    lists: [FreeList; NUM_SIZE_CLASSES],
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
        }
    }

    /// Allocate an object from size class `class_idx`.
    ///
    /// # Safety
    /// `class_idx` must be a valid index into the size-class table.
    #[inline]
    pub unsafe fn allocate(
        &mut self,
        class_idx: usize,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &'static PageMap,
    ) -> *mut u8 {
        let list = &mut self.lists[class_idx];
        if !list.head.is_null() {
            let obj = list.head;
            list.head = unsafe { (*obj).next };
            list.length -= 1;
            stat_inc!(thread_cache_hits);
            return obj as *mut u8;
        }
        unsafe { self.fetch_from_central(class_idx, size, central, page_cache, pagemap) }
    }

    /// Return an object of size class `class_idx` to this thread's cache.
    /// Once the list reaches its current ceiling (`ListTooLong`), the whole
    /// batch is handed back to the central cache in one go.
    ///
    /// # Safety
    /// `ptr` must have come from a prior `allocate` call for `class_idx`.
    #[inline]
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        class_idx: usize,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &'static PageMap,
    ) {
        let list = &mut self.lists[class_idx];
        let obj = ptr as *mut FreeObject;
        list.push(obj);

        if list.length >= list.max_length {
            unsafe { self.release_to_central(class_idx, size, central, page_cache, pagemap) };
        }
    }

    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        class_idx: usize,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &'static PageMap,
    ) -> *mut u8 {
        let ceiling = size_class::num_move_size(size);
        let list = &mut self.lists[class_idx];
        let want = list.max_length.min(ceiling).max(1);

        let (count, head, tail) = unsafe { central.fetch_range(size, want, page_cache, pagemap) };
        if count == 0 || head.is_null() {
            return ptr::null_mut();
        }

        let result = head;
        let rest = unsafe { (*head).next };
        if count > 1 {
            list.push_batch(rest, tail, count - 1);
        }

        if list.max_length < ceiling {
            list.max_length += 1;
        }

        result as *mut u8
    }

    /// `ListTooLong`: pop exactly `max_length` objects and hand the whole
    /// batch back to the central cache.
    #[cold]
    unsafe fn release_to_central(
        &mut self,
        class_idx: usize,
        size: usize,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &'static PageMap,
    ) {
        let list = &mut self.lists[class_idx];
        let (count, head, _tail) = list.pop_range(list.max_length);
        if count == 0 {
            return;
        }
        unsafe { central.release_list(head, size, page_cache, pagemap) };
    }

    /// Flush every size class's free list back to the central cache. Called
    /// once at thread exit so no memory is stranded in a dead thread's cache.
    ///
    /// # Safety
    /// Must only be called once, as the thread cache is torn down.
    pub unsafe fn flush(
        &mut self,
        central: &CentralCache,
        page_cache: &SpinMutex<PageCache>,
        pagemap: &'static PageMap,
    ) {
        for class_idx in 0..NUM_SIZE_CLASSES {
            let list = &mut self.lists[class_idx];
            if list.length == 0 {
                continue;
            }
            let size = size_class::class_size(class_idx);
            let (count, head, _tail) = list.pop_range(list.length);
            if count > 0 {
                unsafe { central.release_list(head, size, page_cache, pagemap) };
            }
        }
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
    fn allocate_then_deallocate_reuses_slot() {
        let (pm, pc, central) = make_env();
        let mut tc = ThreadCache::new();
        let class_idx = size_class::index(32);
        unsafe {
            let a = tc.allocate(class_idx, 32, &central, &pc, pm);
            assert!(!a.is_null());
            tc.deallocate(a, class_idx, 32, &central, &pc, pm);
            let b = tc.allocate(class_idx, 32, &central, &pc, pm);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn max_length_grows_by_one_per_fetch() {
        let (pm, pc, central) = make_env();
        let mut tc = ThreadCache::new();
        let class_idx = size_class::index(64);
        unsafe {
            assert_eq!(tc.lists[class_idx].max_length, 1);
            let a = tc.allocate(class_idx, 64, &central, &pc, pm);
            tc.deallocate(a, class_idx, 64, &central, &pc, pm);
            // Draining the single cached object forces a second fetch.
            let _b = tc.allocate(class_idx, 64, &central, &pc, pm);
            let _c = tc.allocate(class_idx, 64, &central, &pc, pm);
            assert!(tc.lists[class_idx].max_length >= 2);
        }
    }

    #[test]
    fn flush_returns_everything_to_central() {
        let (pm, pc, central) = make_env();
        let mut tc = ThreadCache::new();
        let class_idx = size_class::index(16);
        unsafe {
            let mut ptrs = alloc::vec::Vec::new();
            for _ in 0..20 {
                ptrs.push(tc.allocate(class_idx, 16, &central, &pc, pm));
            }
            for p in ptrs {
                tc.deallocate(p, class_idx, 16, &central, &pc, pm);
            }
            tc.flush(&central, &pc, pm);
            assert_eq!(tc.lists[class_idx].length, 0);
        }
    }
}
