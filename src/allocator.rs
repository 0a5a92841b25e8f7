//! Top-level allocator: ties the three tiers together and implements
//! `GlobalAlloc`.
//!
//! Global state lives in module-level statics. [`PAGE_MAP`] is genuinely
//! `const`-constructible; [`PageCache`] and [`CentralCache`] are not (their
//! span lists carve a sentinel node from the span slab), so they are built
//! lazily on first use via [`crate::once::Lazy`].
//!
//! Cache strategy:
//! - `std` feature: one [`ThreadCache`] per OS thread via `std::thread_local!`,
//!   flushed back to the central cache when the thread exits.
//! - without `std`: no thread-local tier; every allocation talks to the
//!   central cache directly (still correct, just without the fast path).

use crate::central_cache::CentralCache;
use crate::config::{MAX_BYTES, PAGE_SHIFT, PAGE_SIZE};
use crate::once::Lazy;
use crate::page_cache::PageCache;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span;
use crate::sync::SpinMutex;
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

#[cfg(feature = "std")]
use crate::span::FreeObject;
#[cfg(feature = "std")]
use crate::thread_cache::ThreadCache;

pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_CACHE: Lazy<SpinMutex<PageCache>> =
    Lazy::new(|| SpinMutex::new(PageCache::new(&PAGE_MAP)));
pub(crate) static CENTRAL_CACHE: Lazy<CentralCache> = Lazy::new(CentralCache::new);

#[cfg(feature = "std")]
std::thread_local! {
    static TC_CELL: core::cell::UnsafeCell<ThreadCache> =
        const { core::cell::UnsafeCell::new(ThreadCache::new()) };
}

#[cfg(feature = "std")]
struct FlushGuard;

#[cfg(feature = "std")]
impl Drop for FlushGuard {
    fn drop(&mut self) {
        let _ = TC_CELL.try_with(|cell| unsafe {
            let tc = &mut *cell.get();
            tc.flush(CENTRAL_CACHE.get(), PAGE_CACHE.get(), &PAGE_MAP);
        });
    }
}

#[cfg(feature = "std")]
std::thread_local! {
    static FLUSH_GUARD: FlushGuard = const { FlushGuard };
}

/// tcmalloc-style allocator. Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: tricache_alloc::TriCache = tricache_alloc::TriCache;
/// ```
pub struct TriCache;

unsafe impl GlobalAlloc for TriCache {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);

        let align = layout.align();

        if align <= 8 {
            if size <= MAX_BYTES {
                let idx = size_class::index(size);
                return unsafe { self.alloc_small(idx) };
            }
        } else {
            let effective = size.max(align);
            if effective <= MAX_BYTES {
                let idx = size_class::index(effective);
                let class_size = size_class::class_size(idx);
                if align <= PAGE_SIZE && class_size.is_multiple_of(align) {
                    return unsafe { self.alloc_small(idx) };
                }
            }
        }

        unsafe { self.alloc_large(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        stat_inc!(dealloc_count);

        let page_id = (ptr as usize) >> PAGE_SHIFT;
        let span = PAGE_MAP.get(page_id);
        assert!(!span.is_null(), "free of untracked address (double-free or foreign pointer)");

        // Re-derive the size class from span metadata rather than trusting
        // `layout`: a prior in-place realloc shrink can leave the caller
        // holding a smaller layout than the span was actually carved for.
        let obj_size = unsafe { (*span).obj_size };
        if obj_size == 0 {
            unsafe { PAGE_CACHE.get().lock().release_span(span) };
            return;
        }

        let idx = size_class::index(obj_size);
        unsafe { self.dealloc_small(ptr, idx, obj_size) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        let page_id = (ptr as usize) >> PAGE_SHIFT;
        let span = PAGE_MAP.get(page_id);
        let old_usable = if !span.is_null() {
            let obj_size = unsafe { (*span).obj_size };
            if obj_size != 0 {
                obj_size
            } else {
                unsafe { (*span).n * PAGE_SIZE }
            }
        } else {
            layout.size()
        };

        if new_size <= old_usable {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
            unsafe { self.dealloc(ptr, layout) };
        }
        new_ptr
    }
}

impl TriCache {
    #[cfg(feature = "std")]
    #[inline(always)]
    unsafe fn alloc_small(&self, idx: usize) -> *mut u8 {
        let size = size_class::class_size(idx);
        match TC_CELL.try_with(|cell| unsafe {
            let tc = &mut *cell.get();
            tc.allocate(idx, size, CENTRAL_CACHE.get(), PAGE_CACHE.get(), &PAGE_MAP)
        }) {
            Ok(p) => {
                FLUSH_GUARD.with(|_| {});
                p
            }
            Err(_) => unsafe { self.alloc_from_central(idx, size) },
        }
    }

    #[cfg(feature = "std")]
    #[inline(always)]
    unsafe fn dealloc_small(&self, ptr: *mut u8, idx: usize, size: usize) {
        let result = TC_CELL.try_with(|cell| unsafe {
            let tc = &mut *cell.get();
            tc.deallocate(ptr, idx, size, CENTRAL_CACHE.get(), PAGE_CACHE.get(), &PAGE_MAP);
        });
        if result.is_err() {
            unsafe { self.dealloc_to_central(ptr, size) };
        }
    }

    #[cfg(not(feature = "std"))]
    #[inline(always)]
    unsafe fn alloc_small(&self, idx: usize) -> *mut u8 {
        let size = size_class::class_size(idx);
        unsafe { self.alloc_from_central(idx, size) }
    }

    #[cfg(not(feature = "std"))]
    #[inline(always)]
    unsafe fn dealloc_small(&self, ptr: *mut u8, _idx: usize, size: usize) {
        unsafe { self.dealloc_to_central(ptr, size) };
    }

    unsafe fn alloc_from_central(&self, _idx: usize, size: usize) -> *mut u8 {
        stat_inc!(thread_cache_misses);
        stat_inc!(central_cache_hits);
        let (count, head, _tail) =
            unsafe { CENTRAL_CACHE.get().fetch_range(size, 1, PAGE_CACHE.get(), &PAGE_MAP) };
        if count == 0 || head.is_null() {
            ptr::null_mut()
        } else {
            head as *mut u8
        }
    }

    #[cfg(feature = "std")]
    unsafe fn dealloc_to_central(&self, ptr: *mut u8, size: usize) {
        let obj = ptr as *mut FreeObject;
        unsafe { (*obj).next = ptr::null_mut() };
        unsafe { CENTRAL_CACHE.get().release_list(obj, size, PAGE_CACHE.get(), &PAGE_MAP) };
    }

    #[cfg(not(feature = "std"))]
    unsafe fn dealloc_to_central(&self, ptr: *mut u8, size: usize) {
        let obj = ptr as *mut span::FreeObject;
        unsafe { (*obj).next = ptr::null_mut() };
        unsafe { CENTRAL_CACHE.get().release_list(obj, size, PAGE_CACHE.get(), &PAGE_MAP) };
    }

    unsafe fn alloc_large(&self, layout: Layout) -> *mut u8 {
        stat_inc!(page_cache_allocs);

        let size = layout.size();
        let align = layout.align();
        let size_pages = size.div_ceil(PAGE_SIZE);

        if align <= PAGE_SIZE {
            let span = unsafe { PAGE_CACHE.get().lock().new_span(size_pages) };
            if span.is_null() {
                return ptr::null_mut();
            }
            // `new_span`'s bucket-pop and split paths hand back an idle span
            // (`in_use == false`); only the OS-fallback path sets it. Mark it
            // live here so a neighbour's later `release_span` won't coalesce
            // into memory that's still handed out to the caller.
            unsafe { (*span).in_use = true };
            return unsafe { (*span).start_addr() };
        }

        // Over-aligned: allocate extra pages to guarantee an aligned region
        // exists within the span, then trim the prefix/suffix back to the
        // page cache.
        let align_pages = align / PAGE_SIZE;
        let total_pages = size_pages + align_pages - 1;

        let mut pc = PAGE_CACHE.get().lock();
        let span = unsafe { pc.new_span(total_pages) };
        if span.is_null() {
            return ptr::null_mut();
        }
        // Same reasoning as the simple path above: `new_span` doesn't
        // guarantee `in_use`, and this span (trimmed below to its final
        // range) is about to be handed to the caller.
        unsafe { (*span).in_use = true };

        let start = unsafe { (*span).start_addr() } as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let prefix_pages = (aligned - start) / PAGE_SIZE;
        let suffix_pages = total_pages - prefix_pages - size_pages;

        unsafe {
            pc.pagemap().unregister_span(span);

            if prefix_pages > 0 {
                let prefix = span::alloc_span();
                if !prefix.is_null() {
                    (*prefix).page_id = (*span).page_id;
                    (*prefix).n = prefix_pages;
                    pc.release_span(prefix);
                }
            }

            (*span).page_id += prefix_pages;
            (*span).n = size_pages;
            pc.pagemap().register_span(span);

            if suffix_pages > 0 {
                let suffix = span::alloc_span();
                if !suffix.is_null() {
                    (*suffix).page_id = (*span).page_id + size_pages;
                    (*suffix).n = suffix_pages;
                    pc.release_span(suffix);
                }
            }
        }

        aligned as *mut u8
    }
}
