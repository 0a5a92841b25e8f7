//! Three-level radix tree mapping page ids to `Span` pointers.
//!
//! 64-bit address spaces need a multi-level radix rather than the dense
//! array a 32-bit address space could afford (see the spec's own note that a
//! direct-mapped array is ~4 MiB on a 32-bit space but unworkable on 64-bit).
//! Split as root(12) / mid(12) / leaf(11) bits of the page id.
//!
//! Reads ([`PageMap::get`]) are lock-free: `AtomicPtr` loads with `Acquire`.
//! Writes ([`PageMap::set`] and friends) must happen under external
//! synchronization — the page cache's coarse lock. The concurrency argument
//! for why a lock-free reader is safe here lives in `page_cache` and in the
//! top-level crate docs: the page cache never rewrites a slot belonging to
//! an `in_use` span, so a concurrent central-cache free reading that slot
//! always sees a stable value.

use crate::config::PAGE_SIZE;
use crate::platform;
use crate::span::Span;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = 11;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const MID_SHIFT: usize = LEAF_BITS;
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS;

const MID_MASK: usize = (1 << MID_BITS) - 1;
const LEAF_MASK: usize = (1 << LEAF_BITS) - 1;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

/// Page id -> `*mut Span` lookup table, sufficient for both coalescing
/// (boundary-only entries on idle spans) and object-to-span reverse lookup
/// (full-range entries on in-use spans).
pub struct PageMap {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        // A null AtomicPtr has the same bit pattern as zeroed memory.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap {
    pub const fn new() -> Self {
        Self {
            root: null_atomic_array!(ROOT_LEN, MidNode),
        }
    }

    /// Look up the span owning `page_id`. Null if unset. Lock-free.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let root_idx = page_id >> ROOT_SHIFT;
        let mid_idx = (page_id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page_id & LEAF_MASK;

        if root_idx >= ROOT_LEN {
            return ptr::null_mut();
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }
        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }
        unsafe { (*leaf).spans[leaf_idx].load(Ordering::Acquire) }
    }

    /// Write the span owning `page_id` (or clear it with a null `span`).
    ///
    /// # Safety
    /// Must be called under the page cache's coarse lock.
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let root_idx = page_id >> ROOT_SHIFT;
        let mid_idx = (page_id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page_id & LEAF_MASK;

        assert!(root_idx < ROOT_LEN, "page_id out of range for page map");

        let mut mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            mid = unsafe { Self::alloc_mid_node() };
            assert!(!mid.is_null(), "failed to grow page map (mid node)");
            self.root[root_idx].store(mid, Ordering::Release);
        }

        let mut leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            leaf = unsafe { Self::alloc_leaf_node() };
            assert!(!leaf.is_null(), "failed to grow page map (leaf node)");
            unsafe { (*mid).children[mid_idx].store(leaf, Ordering::Release) };
        }

        unsafe { (*leaf).spans[leaf_idx].store(span, Ordering::Release) };
    }

    /// Register every page of an in-use span (needed for object->span lookup
    /// on free, since a deallocation can name any interior page).
    ///
    /// # Safety
    /// Must be called under the page cache's coarse lock.
    pub unsafe fn register_span(&self, span: *mut Span) {
        let start = unsafe { (*span).page_id };
        let count = unsafe { (*span).n };
        for page_id in start..start + count {
            unsafe { self.set(page_id, span) };
        }
    }

    /// Register only the first and last page of an idle span — sufficient
    /// for coalescing, which only ever queries a neighbour's boundary page.
    ///
    /// # Safety
    /// Must be called under the page cache's coarse lock.
    pub unsafe fn register_span_endpoints(&self, span: *mut Span) {
        let start = unsafe { (*span).page_id };
        let count = unsafe { (*span).n };
        unsafe { self.set(start, span) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span) };
        }
    }

    /// Clear every page entry of a span.
    ///
    /// # Safety
    /// Must be called under the page cache's coarse lock.
    pub unsafe fn unregister_span(&self, span: *mut Span) {
        let start = unsafe { (*span).page_id };
        let count = unsafe { (*span).n };
        for page_id in start..start + count {
            unsafe { self.set(page_id, ptr::null_mut()) };
        }
    }

    unsafe fn alloc_mid_node() -> *mut MidNode {
        let size = core::mem::size_of::<MidNode>();
        let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        unsafe { platform::page_alloc(alloc_size) }.cast::<MidNode>()
    }

    unsafe fn alloc_leaf_node() -> *mut LeafNode {
        let size = core::mem::size_of::<LeafNode>();
        let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        unsafe { platform::page_alloc(alloc_size) }.cast::<LeafNode>()
    }
}
