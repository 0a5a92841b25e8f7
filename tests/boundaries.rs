//! Literal boundary scenarios from the allocator's specification: smallest
//! object, size-class boundaries, exact span carve/coalesce, and the
//! large-object bypass threshold.

use std::alloc::{GlobalAlloc, Layout};
use tricache_alloc::TriCache;

#[global_allocator]
static GLOBAL: TriCache = TriCache;

#[test]
fn smallest_object_is_aligned_and_reusable() {
    let layout = Layout::from_size_align(1, 1).unwrap();
    unsafe {
        let ptr = GLOBAL.alloc(layout);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 8, 0, "smallest object must land in the 8-byte tier");
        ptr.write_bytes(0x11, 1);
        GLOBAL.dealloc(ptr, layout);

        // The freed slot should be handed straight back out again.
        let ptr2 = GLOBAL.alloc(layout);
        assert!(!ptr2.is_null());
        GLOBAL.dealloc(ptr2, layout);
    }
}

#[test]
fn size_class_boundaries_round_trip() {
    // 128 and 129 bytes sit either side of the 8-byte/16-byte tier boundary.
    for &size in &[1usize, 127, 128, 129, 1024, 1025, 65536, 65537, 262144] {
        let layout = Layout::from_size_align(size, 8).unwrap();
        unsafe {
            let ptr = GLOBAL.alloc(layout);
            assert!(!ptr.is_null(), "alloc failed at boundary size {size}");
            ptr.write_bytes(0x22, size);
            for i in 0..size {
                assert_eq!(*ptr.add(i), 0x22);
            }
            GLOBAL.dealloc(ptr, layout);
        }
    }
}

#[test]
fn exact_span_carve_drains_and_returns_cleanly() {
    // Hand out every object an 8-byte span refill carves, then free them
    // all back; nothing should be lost or corrupted in between.
    let size = 8usize;
    let pages = tricache_alloc::size_class::num_move_page(size);
    let count = (pages * tricache_alloc::PAGE_SIZE) / size;

    let layout = Layout::from_size_align(size, 8).unwrap();
    let mut ptrs = Vec::with_capacity(count);
    unsafe {
        for _ in 0..count {
            let p = GLOBAL.alloc(layout);
            assert!(!p.is_null());
            ptrs.push(p);
        }

        let unique: std::collections::HashSet<usize> = ptrs.iter().map(|&p| p as usize).collect();
        assert_eq!(unique.len(), ptrs.len(), "overlapping addresses handed out from one span carve");

        for p in ptrs {
            GLOBAL.dealloc(p, layout);
        }
    }
}

#[test]
fn adjacent_frees_coalesce_regardless_of_order() {
    // Two large-object spans (above MAX_BYTES, so each comes straight from
    // the page cache rather than a size-class carve), freed in each possible
    // order; the allocator should remain usable and not panic on
    // assert-checked invariants.
    let layout = Layout::from_size_align(300 * 1024, 8).unwrap();
    unsafe {
        let a = GLOBAL.alloc(layout);
        let b = GLOBAL.alloc(layout);
        assert!(!a.is_null() && !b.is_null());
        GLOBAL.dealloc(b, layout);
        GLOBAL.dealloc(a, layout);

        let c = GLOBAL.alloc(layout);
        let d = GLOBAL.alloc(layout);
        assert!(!c.is_null() && !d.is_null());
        GLOBAL.dealloc(c, layout);
        GLOBAL.dealloc(d, layout);
    }
}

#[test]
fn large_object_bypasses_thread_and_central_caches() {
    // 200 KiB: within MAX_BYTES, so still size-classed (8 KiB tier), but its
    // central-cache refill spans many pages from the page cache.
    let within = Layout::from_size_align(200 * 1024, 8).unwrap();
    // 2 MiB: exceeds MAX_PAGES (128 pages = 1 MiB), served straight from the
    // OS, bypassing the page cache's split/coalesce buckets entirely.
    let beyond = Layout::from_size_align(2 * 1024 * 1024, 8).unwrap();

    unsafe {
        let p1 = GLOBAL.alloc(within);
        assert!(!p1.is_null());
        GLOBAL.dealloc(p1, within);

        let p2 = GLOBAL.alloc(beyond);
        assert!(!p2.is_null());
        p2.write_bytes(0x33, beyond.size());
        GLOBAL.dealloc(p2, beyond);
    }
}

#[test]
fn many_threads_allocate_and_free_without_corruption() {
    let nthreads = 32usize;
    let ops = 2000usize;

    let handles: Vec<_> = (0..nthreads)
        .map(|tid| {
            std::thread::spawn(move || unsafe {
                let layout = Layout::from_size_align(64, 8).unwrap();
                for i in 0..ops {
                    let ptr = GLOBAL.alloc(layout);
                    assert!(!ptr.is_null(), "thread {tid} alloc failed at op {i}");
                    ptr.write_bytes((tid as u8).wrapping_add(i as u8), 64);
                    let expected = (tid as u8).wrapping_add(i as u8);
                    for b in 0..64 {
                        assert_eq!(*ptr.add(b), expected);
                    }
                    GLOBAL.dealloc(ptr, layout);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
