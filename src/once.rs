//! Minimal lazy-initialized static cell.
//!
//! `PageCache` and `CentralCache` both carve a sentinel span out of the span
//! slab when their `SpanList`s are built, so they cannot be constructed in a
//! `const` context the way `PageMap` can. `Lazy` defers that construction to
//! first use, matching the "single Allocator value constructed on first use"
//! shape: a process-global is built exactly once, the first time any thread
//! actually needs it, guarded by the same `SpinLock` the rest of the
//! allocator uses.

use crate::sync::SpinLock;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

pub struct Lazy<T> {
    init: fn() -> T,
    ready: AtomicBool,
    build_lock: SpinLock,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: `value` is written at most once, under `build_lock`, before
// `ready` is set with Release ordering; every reader checks `ready` with
// Acquire ordering before touching `value`, so the write happens-before
// any read.
unsafe impl<T: Sync> Sync for Lazy<T> {}

impl<T> Lazy<T> {
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            init,
            ready: AtomicBool::new(false),
            build_lock: SpinLock::new(),
            value: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub fn get(&self) -> &T {
        if !self.ready.load(Ordering::Acquire) {
            self.init_slow();
        }
        // SAFETY: `ready` observed true with Acquire, so the Release store
        // in `init_slow` happened-before this read; `value` is initialized
        // and never mutated again.
        unsafe { (*self.value.get()).as_ref().unwrap_unchecked() }
    }

    #[cold]
    fn init_slow(&self) {
        self.build_lock.lock();
        if !self.ready.load(Ordering::Relaxed) {
            let built = (self.init)();
            unsafe { *self.value.get() = Some(built) };
            self.ready.store(true, Ordering::Release);
        }
        self.build_lock.unlock();
    }
}
